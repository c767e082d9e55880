use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use log::Level;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::backup::StateBackup;
use crate::errors::ErrorKind;
use crate::logger::Logger;
use crate::model::toggle::{Toggle, ToggleState};

/// A store API for the current toggles, used to make custom store implementations.
///
/// Reads must not block on writes.
pub trait ToggleCache: Sync + Send {
    /// Gets the current state, if any was written.
    fn read(&self) -> Option<Arc<ToggleState>>;

    /// Gets a single toggle of the current state.
    fn get(&self, key: &str) -> Option<Toggle> {
        self.read().and_then(|state| state.get(key).cloned())
    }

    /// Replaces the current state.
    fn write(&self, state: Arc<ToggleState>);
}

/// [`ToggleCache`] keeping the state in memory, the default.
#[derive(Default)]
pub struct InMemoryToggleCache {
    state: ArcSwapOption<ToggleState>,
}

impl InMemoryToggleCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ToggleCache for InMemoryToggleCache {
    fn read(&self) -> Option<Arc<ToggleState>> {
        self.state.load_full()
    }

    fn write(&self, state: Arc<ToggleState>) {
        self.state.store(Some(state));
    }
}

/// Stream of accepted states.
///
/// The first call to [`StateUpdates::next`] yields the current state when there is one.
/// A slow reader skips intermediate states and always continues with the newest.
pub struct StateUpdates {
    receiver: watch::Receiver<Option<Arc<ToggleState>>>,
    primed: bool,
}

impl StateUpdates {
    /// Waits for the next state. Returns `None` once the cache is gone.
    pub async fn next(&mut self) -> Option<Arc<ToggleState>> {
        if !self.primed {
            self.primed = true;
            if let Some(state) = self.receiver.borrow_and_update().clone() {
                return Some(state);
            }
        }
        loop {
            if self.receiver.changed().await.is_err() {
                return None;
            }
            if let Some(state) = self.receiver.borrow_and_update().clone() {
                return Some(state);
            }
        }
    }

    /// The newest published state, without waiting.
    pub fn latest(&self) -> Option<Arc<ToggleState>> {
        self.receiver.borrow().clone()
    }
}

/// Holds the latest accepted [`ToggleState`], persists it and republishes it to subscribers.
pub struct ObservableCache {
    cache: Box<dyn ToggleCache>,
    backup: Arc<dyn StateBackup>,
    updates: watch::Sender<Option<Arc<ToggleState>>>,
    write_lock: Mutex<()>,
    logger: Logger,
}

impl ObservableCache {
    /// Wraps `cache`, publishing whatever it already holds as the current state.
    pub fn new(cache: Box<dyn ToggleCache>, backup: Arc<dyn StateBackup>, logger: Logger) -> Self {
        let (updates, _) = watch::channel(cache.read());
        Self {
            cache,
            backup,
            updates,
            write_lock: Mutex::new(()),
            logger,
        }
    }

    /// The current state.
    pub fn read(&self) -> Option<Arc<ToggleState>> {
        self.cache.read()
    }

    /// A single toggle of the current state.
    pub fn get(&self, key: &str) -> Option<Toggle> {
        self.cache.get(key)
    }

    /// Stores `state` and publishes it. Never waits for subscribers.
    pub fn write(&self, state: Arc<ToggleState>) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cache.write(Arc::clone(&state));
        log_debug!(
            self.logger,
            "Stored state with {} toggles, publishing to {} subscriber(s)",
            state.toggles().len(),
            self.updates.receiver_count()
        );
        self.updates.send_replace(Some(state));
    }

    /// Resolves once `state`, or a state fetched after it, is the published one.
    pub(crate) async fn published(&self, state: &Arc<ToggleState>) {
        let mut receiver = self.updates.subscribe();
        let _ = receiver
            .wait_for(|current| {
                current
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, state) || current.fetched_at() > state.fetched_at())
            })
            .await;
    }

    /// Subscribes to published states, see [`StateUpdates`].
    pub fn subscribe(&self) -> StateUpdates {
        StateUpdates {
            receiver: self.updates.subscribe(),
            primed: false,
        }
    }

    /// Writes every state received from `upstream`, then persists it through the backup.
    ///
    /// The task ends when the sending side is dropped.
    pub fn subscribe_to(self: &Arc<Self>, mut upstream: mpsc::UnboundedReceiver<Arc<ToggleState>>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        log_debug!(self.logger, "Subscribing to upstream states");
        tokio::spawn(async move {
            while let Some(state) = upstream.recv().await {
                this.write(Arc::clone(&state));
                this.persist(state).await;
            }
        })
    }

    async fn persist(&self, state: Arc<ToggleState>) {
        let backup = Arc::clone(&self.backup);
        let result = tokio::task::spawn_blocking(move || backup.save(&state)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log_event!(self.logger, Level::Warn, ErrorKind::PersistenceFailure, "Failed to save toggle state backup. {err}")
            }
            Err(err) => {
                log_event!(self.logger, Level::Error, ErrorKind::PersistenceFailure, "Toggle state backup task failed. {err}")
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod cache_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::mpsc;

    use crate::backup::{BackupError, NoopBackup, StateBackup};
    use crate::cache::{InMemoryToggleCache, ObservableCache};
    use crate::logger::Logger;
    use crate::model::context::Context;
    use crate::model::toggle::{Toggle, ToggleState, Variant};

    pub fn state_with(user_id: &str, toggles: &[(&str, bool)]) -> Arc<ToggleState> {
        Arc::new(ToggleState::new(
            toggles
                .iter()
                .map(|(name, enabled)| Toggle {
                    name: (*name).to_owned(),
                    enabled: *enabled,
                    impression_data: false,
                    variant: Variant::disabled(),
                })
                .collect(),
            Context::new().user_id(user_id),
            Utc::now(),
            None,
        ))
    }

    #[derive(Default)]
    pub struct RecordingBackup {
        pub saved: Mutex<Vec<ToggleState>>,
        pub fail: bool,
        pub attempts: AtomicUsize,
    }

    impl StateBackup for RecordingBackup {
        fn load(&self, context: &Context) -> Result<Option<ToggleState>, BackupError> {
            let saved = self.saved.lock().unwrap();
            Ok(saved.iter().rev().find(|s| s.context() == context).cloned())
        }

        fn save(&self, state: &ToggleState) -> Result<(), BackupError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BackupError::Io(std::io::Error::other("disk full")));
            }
            self.saved.lock().unwrap().push(state.clone());
            Ok(())
        }
    }

    fn cache_with(backup: Arc<dyn StateBackup>) -> Arc<ObservableCache> {
        Arc::new(ObservableCache::new(Box::new(InMemoryToggleCache::new()), backup, Logger::default()))
    }

    #[test]
    fn write_and_read() {
        let cache = cache_with(Arc::new(NoopBackup::new()));
        assert!(cache.read().is_none());
        assert!(cache.get("a").is_none());

        cache.write(state_with("1", &[("a", true), ("b", false)]));
        assert!(cache.get("a").unwrap().enabled);
        assert!(!cache.get("b").unwrap().enabled);

        cache.write(state_with("2", &[("b", true)]));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").unwrap().enabled);
        assert_eq!(cache.read().unwrap().context().get_user_id(), Some("2"));
    }

    #[tokio::test]
    async fn late_subscriber_gets_latest_state() {
        let cache = cache_with(Arc::new(NoopBackup::new()));
        cache.write(state_with("1", &[("a", true)]));
        cache.write(state_with("2", &[("a", false)]));

        let mut updates = cache.subscribe();
        let state = updates.next().await.unwrap();
        assert_eq!(state.context().get_user_id(), Some("2"));
    }

    #[tokio::test]
    async fn slow_subscriber_skips_to_newest() {
        let cache = cache_with(Arc::new(NoopBackup::new()));
        let mut updates = cache.subscribe();
        for id in ["1", "2", "3"] {
            cache.write(state_with(id, &[("a", true)]));
        }
        let state = updates.next().await.unwrap();
        assert_eq!(state.context().get_user_id(), Some("3"));

        let pending = tokio::time::timeout(Duration::from_millis(50), updates.next()).await;
        assert!(pending.is_err());

        cache.write(state_with("4", &[("a", true)]));
        let state = updates.next().await.unwrap();
        assert_eq!(state.context().get_user_id(), Some("4"));
    }

    #[tokio::test]
    async fn subscribe_to_stores_and_persists() {
        let backup = Arc::new(RecordingBackup::default());
        let cache = cache_with(backup.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let task = cache.subscribe_to(rx);

        tx.send(state_with("1", &[("a", true)])).unwrap();
        tx.send(state_with("2", &[("a", false)])).unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(!cache.get("a").unwrap().enabled);
        let saved = backup.saved.lock().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].context().get_user_id(), Some("2"));
    }

    #[tokio::test]
    async fn persistence_failure_keeps_memory_state() {
        let backup = Arc::new(RecordingBackup {
            fail: true,
            ..RecordingBackup::default()
        });
        let cache = cache_with(backup.clone());
        let mut updates = cache.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = cache.subscribe_to(rx);

        tx.send(state_with("1", &[("a", true)])).unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(cache.get("a").unwrap().enabled);
        assert_eq!(updates.next().await.unwrap().context().get_user_id(), Some("1"));
        assert_eq!(backup.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn published_waits_for_the_writer() {
        let cache = cache_with(Arc::new(NoopBackup::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        cache.subscribe_to(rx);

        let first = state_with("1", &[("a", true)]);
        tx.send(Arc::clone(&first)).unwrap();
        cache.published(&first).await;
        assert!(cache.get("a").unwrap().enabled);

        // a newer state also satisfies the wait for an older one
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = state_with("2", &[("a", false)]);
        cache.write(Arc::clone(&second));
        tokio::time::timeout(Duration::from_millis(50), cache.published(&first))
            .await
            .unwrap();
    }
}
