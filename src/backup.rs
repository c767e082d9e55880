use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::context::Context;
use crate::model::toggle::ToggleState;
use crate::utils::sha1;

/// Failure of a [`StateBackup`] operation.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Reading or writing the backup medium failed.
    #[error("Backup I/O failed. ({0})")]
    Io(#[from] std::io::Error),
    /// The stored state could not be (de)serialized.
    #[error("Backup content is invalid. ({0})")]
    Format(#[from] serde_json::Error),
}

/// Storage API for the last known [`ToggleState`], used to make custom backup implementations.
///
/// The cache calls [`StateBackup::save`] after every accepted state; the client calls
/// [`StateBackup::load`] once on start to have toggles before the first fetch completes.
/// Failures are logged and never affect the in-memory state.
pub trait StateBackup: Sync + Send {
    /// Loads the state saved for `context`, if any.
    fn load(&self, context: &Context) -> Result<Option<ToggleState>, BackupError>;

    /// Saves the given state.
    fn save(&self, state: &ToggleState) -> Result<(), BackupError>;
}

/// [`StateBackup`] that keeps nothing, the default.
#[derive(Default)]
pub struct NoopBackup {}

impl NoopBackup {
    /// Creates a backup that never loads or saves anything.
    pub fn new() -> Self {
        Self {}
    }
}

impl StateBackup for NoopBackup {
    fn load(&self, _: &Context) -> Result<Option<ToggleState>, BackupError> {
        Ok(None)
    }

    fn save(&self, _: &ToggleState) -> Result<(), BackupError> {
        Ok(())
    }
}

/// [`StateBackup`] that keeps one JSON file per application and context in a directory.
///
/// # Examples
///
/// ```no_run
/// use unleash_sync::{Client, FileBackup};
///
/// # async fn run() {
/// let client = Client::builder("https://proxy.example.com/proxy", "client-key", "my-app")
///     .backup(Box::new(FileBackup::new("/var/cache/my-app", "my-app")))
///     .build()
///     .unwrap();
/// # }
/// ```
pub struct FileBackup {
    dir: PathBuf,
    app_name: String,
}

impl FileBackup {
    /// Creates a backup storing one file per context under `dir`.
    pub fn new(dir: impl Into<PathBuf>, app_name: &str) -> Self {
        Self {
            dir: dir.into(),
            app_name: app_name.to_owned(),
        }
    }

    fn path_for(&self, context: &Context) -> Result<PathBuf, BackupError> {
        let context_json = serde_json::to_string(context)?;
        let key = sha1(format!("{}_{}", self.app_name, context_json).as_str());
        Ok(self.dir.join(format!("unleash-state-{key}.json")))
    }
}

impl StateBackup for FileBackup {
    fn load(&self, context: &Context) -> Result<Option<ToggleState>, BackupError> {
        let path = self.path_for(context)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let state: ToggleState = serde_json::from_str(&content)?;
        // a hash collision must not hand out toggles of another context
        if state.context() != context {
            return Ok(None);
        }
        Ok(Some(state))
    }

    fn save(&self, state: &ToggleState) -> Result<(), BackupError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(state.context())?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(state)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod backup_tests {
    use chrono::Utc;

    use crate::backup::{FileBackup, NoopBackup, StateBackup};
    use crate::model::context::Context;
    use crate::model::toggle::{Toggle, ToggleState, Variant};

    fn state(context: Context) -> ToggleState {
        ToggleState::new(
            vec![Toggle {
                name: "toggle".to_owned(),
                enabled: true,
                impression_data: false,
                variant: Variant::disabled(),
            }],
            context,
            Utc::now(),
            Some("etag".to_owned()),
        )
    }

    #[test]
    fn file_backup_per_context() {
        let dir = tempfile::tempdir().unwrap();
        let backup = FileBackup::new(dir.path(), "test-app");
        let first = Context::new().user_id("1");
        let second = Context::new().user_id("2");

        assert!(backup.load(&first).unwrap().is_none());

        let saved = state(first.clone());
        backup.save(&saved).unwrap();
        assert_eq!(backup.load(&first).unwrap(), Some(saved));
        assert!(backup.load(&second).unwrap().is_none());

        let replaced = state(first.clone());
        backup.save(&replaced).unwrap();
        assert_eq!(backup.load(&first).unwrap(), Some(replaced));
    }

    #[test]
    fn file_backup_invalid_content() {
        let dir = tempfile::tempdir().unwrap();
        let backup = FileBackup::new(dir.path(), "test-app");
        let context = Context::new();
        backup.save(&state(context.clone())).unwrap();
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            std::fs::write(entry.unwrap().path(), "{").unwrap();
        }
        let err = backup.load(&context).unwrap_err();
        assert!(err.to_string().starts_with("Backup content is invalid."));
    }

    #[test]
    fn noop_backup() {
        let backup = NoopBackup::new();
        backup.save(&state(Context::new())).unwrap();
        assert!(backup.load(&Context::new()).unwrap().is_none());
    }
}
