use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy for the send path and its REST surface.
///
/// `Validation`, `Blocked`, and `InsufficientBalance` are rejected before
/// any persistence — never partially applied. `Transport` only ever
/// originates on the device side.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Messaging is blocked between these users")]
    Blocked,

    #[error("Insufficient balance: need {required}, have {balance} (short {shortfall})")]
    InsufficientBalance {
        required: u64,
        balance: u64,
        shortfall: u64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl SendError {
    pub fn insufficient(required: u64, balance: u64) -> Self {
        Self::InsufficientBalance {
            required,
            balance,
            shortfall: required.saturating_sub(balance),
        }
    }

    /// Machine-readable code carried in the REST error body.
    pub fn code(&self) -> &'static str {
        match self {
            SendError::Validation(_) => "VALIDATION",
            SendError::Blocked => "BLOCKED",
            SendError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            SendError::NotFound(_) => "NOT_FOUND",
            SendError::Transport(_) => "TRANSPORT",
        }
    }
}

/// JSON error body exchanged over REST. The server renders it from a
/// [`SendError`]; the client parses it back into one so UI code switches on
/// the typed variant, not on strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortfall: Option<u64>,
}

impl ErrorBody {
    pub fn from_send_error(err: &SendError) -> Self {
        let (required, balance, shortfall) = match err {
            SendError::InsufficientBalance {
                required,
                balance,
                shortfall,
            } => (Some(*required), Some(*balance), Some(*shortfall)),
            _ => (None, None, None),
        };
        Self {
            error: err.to_string(),
            code: err.code().to_string(),
            required,
            balance,
            shortfall,
        }
    }

    /// Reconstruct the typed error. Unknown codes map to `Transport` so the
    /// caller still gets a retryable failure rather than a panic.
    pub fn into_send_error(self) -> SendError {
        match self.code.as_str() {
            "VALIDATION" => SendError::Validation(self.error),
            "BLOCKED" => SendError::Blocked,
            "INSUFFICIENT_BALANCE" => SendError::InsufficientBalance {
                required: self.required.unwrap_or(0),
                balance: self.balance.unwrap_or(0),
                shortfall: self.shortfall.unwrap_or(0),
            },
            "NOT_FOUND" => SendError::NotFound(self.error),
            _ => SendError::Transport(self.error),
        }
    }
}
