use serde::{Deserialize, Serialize};

/// A resolved caller.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

/// Token and user id handed to every storage call.
///
/// The local backend authorizes on `user_id`; the remote backend forwards
/// `token` to the bucket API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserContext {
    pub token: String,
    pub user_id: String,
}

impl UserContext {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }
}
