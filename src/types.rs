use serde::{Deserialize, Serialize};

/// Opaque ID types for type safety
pub type Uid = String;
pub type SessionId = String;

/// Arena key for a live connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Verified identity as returned by the identity gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub uid: Uid,
    pub display_name: String,
    pub email: String,
    #[serde(default)]
    pub picture: Option<String>,
}

impl Identity {
    /// Snapshot used when banning a uid that is not currently connected
    pub fn placeholder(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            display_name: uid.to_string(),
            email: String::new(),
            picture: None,
        }
    }
}

/// Public projection of an identity, as shown in lists and speaker updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub uid: Uid,
    pub display_name: String,
    pub email: String,
    pub picture: Option<String>,
}

impl From<&Identity> for ParticipantView {
    fn from(identity: &Identity) -> Self {
        Self {
            uid: identity.uid.clone(),
            display_name: identity.display_name.clone(),
            email: identity.email.clone(),
            picture: identity.picture.clone(),
        }
    }
}

/// Queue entry as shown to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueView {
    pub uid: Uid,
    pub display_name: String,
    pub email: String,
    pub picture: Option<String>,
    pub requested_at: String,
}
