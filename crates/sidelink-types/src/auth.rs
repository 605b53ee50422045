use std::fmt;

use serde::{Deserialize, Serialize};

/// Last known validity of the control-plane credential, as reported by the
/// background auth poller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthStatus {
    None,
    Valid,
    InvalidToken,
    NoToken,
    Failed,
}

impl AuthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthStatus::None => "NONE",
            AuthStatus::Valid => "VALID",
            AuthStatus::InvalidToken => "INVALID_TOKEN",
            AuthStatus::NoToken => "NO_TOKEN",
            AuthStatus::Failed => "FAILED",
        }
    }

    /// Statuses that require a fresh interactive sign-in.
    pub fn requires_sign_in(self) -> bool {
        matches!(self, AuthStatus::NoToken | AuthStatus::Failed)
    }

    /// The credential is being refreshed and requests should wait.
    pub fn is_transient(self) -> bool {
        matches!(self, AuthStatus::InvalidToken)
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
