use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const USER_ID: &str = "userId";
const SESSION_ID: &str = "sessionId";
const REMOTE_ADDRESS: &str = "remoteAddress";

/// Describes the entity the toggles are evaluated for.
///
/// A context is a value: two contexts with the same fields are the same context, and the
/// fetcher uses this equality to skip redundant requests.
///
/// # Examples:
///
/// ```rust
/// use unleash_sync::Context;
///
/// let context = Context::new()
///     .user_id("123")
///     .session_id("abc")
///     .property("tier", "gold");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_address: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    properties: BTreeMap<String, String>,
}

impl Context {
    /// Initializes an empty [`Context`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier of the user.
    pub fn user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_owned());
        self
    }

    /// Identifier of the current session.
    pub fn session_id(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_owned());
        self
    }

    /// Address of the requesting client.
    pub fn remote_address(mut self, remote_address: &str) -> Self {
        self.remote_address = Some(remote_address.to_owned());
        self
    }

    /// Custom property. Setting the same key twice keeps the last value.
    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_owned(), value.to_owned());
        self
    }

    /// The user id, if set.
    pub fn get_user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// The session id, if set.
    pub fn get_session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The remote address, if set.
    pub fn get_remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    /// Value of the custom property `key`.
    pub fn get_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Flattens the context into query pairs. Custom properties are namespaced as
    /// `properties[<key>]` and come in key order, so equal contexts produce equal queries.
    pub(crate) fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(3 + self.properties.len());
        let fields = [
            (USER_ID, &self.user_id),
            (SESSION_ID, &self.session_id),
            (REMOTE_ADDRESS, &self.remote_address),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                pairs.push((key.to_owned(), value.clone()));
            }
        }
        for (key, value) in &self.properties {
            pairs.push((format!("properties[{key}]"), value.clone()));
        }
        pairs
    }
}
