use crate::constants::DISABLED_VARIANT_NAME;
use crate::model::context::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("JSON parsing failed. ({0})")]
    Parse(String),
}

/// Payload attached to a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// The payload type as configured on the server (`string`, `json`, `csv`, `number`).
    #[serde(rename = "type")]
    pub payload_type: String,
    /// The raw payload value.
    pub value: String,
}

/// Variant of a toggle as evaluated by the server for the current [`Context`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    /// Name of the variant.
    pub name: String,
    /// Whether the variant is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Whether the toggle the variant belongs to is enabled.
    #[serde(default, alias = "featureEnabled")]
    pub feature_enabled: bool,
    /// Optional payload of the variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl Variant {
    /// Creates an enabled variant without payload.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            enabled: true,
            feature_enabled: true,
            payload: None,
        }
    }

    /// The variant reported for unknown or disabled toggles.
    pub fn disabled() -> Self {
        Self {
            name: DISABLED_VARIANT_NAME.to_owned(),
            enabled: false,
            feature_enabled: false,
            payload: None,
        }
    }
}

impl Default for Variant {
    fn default() -> Self {
        Self::disabled()
    }
}

/// A feature toggle as delivered by the frontend API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Toggle {
    /// Name of the toggle.
    pub name: String,
    /// Whether the toggle is enabled for the context it was fetched with.
    pub enabled: bool,
    /// Whether impression events are requested for this toggle.
    #[serde(default)]
    pub impression_data: bool,
    /// The evaluated variant.
    #[serde(default)]
    pub variant: Variant,
}

#[derive(Deserialize)]
struct TogglesDocument {
    toggles: Vec<Toggle>,
}

/// Immutable snapshot of the toggles fetched for a [`Context`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToggleState {
    toggles: HashMap<String, Toggle>,
    context: Context,
    fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
}

impl ToggleState {
    /// Creates a state from a list of toggles. Later entries win on duplicate names.
    pub fn new(
        toggles: Vec<Toggle>,
        context: Context,
        fetched_at: DateTime<Utc>,
        etag: Option<String>,
    ) -> Self {
        Self {
            toggles: toggles.into_iter().map(|t| (t.name.clone(), t)).collect(),
            context,
            fetched_at,
            etag,
        }
    }

    /// All toggles by name.
    pub fn toggles(&self) -> &HashMap<String, Toggle> {
        &self.toggles
    }

    /// A toggle by name.
    pub fn get(&self, name: &str) -> Option<&Toggle> {
        self.toggles.get(name)
    }

    /// The context the toggles were fetched for.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// When the response was received.
    pub fn fetched_at(&self) -> &DateTime<Utc> {
        &self.fetched_at
    }

    /// Validity marker of the response, sent back as `If-None-Match` on the next fetch.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }
}

pub fn state_from_json(
    json: &str,
    context: Context,
    etag: Option<String>,
    fetched_at: DateTime<Utc>,
) -> Result<ToggleState, Error> {
    match serde_json::from_str::<TogglesDocument>(json) {
        Ok(doc) => Ok(ToggleState::new(doc.toggles, context, fetched_at, etag)),
        Err(err) => Err(Error::Parse(err.to_string())),
    }
}
