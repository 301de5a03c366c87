use serde::{Deserialize, Serialize};

/// Authenticated user identity bound to a connection.
///
/// Supplied by the host application's auth layer, which has already
/// validated the credential. Immutable once bound.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Identity {
    /// An identity with an empty id or login is rejected at bind time.
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_empty() && !self.login.is_empty()
    }
}
