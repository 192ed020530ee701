use std::{path::PathBuf, time::Duration};

/// Core error type for the monitor.
///
/// Adapter crates map their specific errors into this type so the poll loop and
/// the command listener can decide per variant whether to back off, retry or drop.
/// Only `Config` (and a store that cannot be opened) is fatal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("delivery error: {reason}")]
    Delivery {
        reason: String,
        /// Server-provided wait before the next attempt (Telegram `retry_after`).
        retry_after: Option<Duration>,
        /// Auth failures and similar; retrying cannot help.
        permanent: bool,
    },

    #[error("storage error: {path}: {reason}")]
    Storage { path: PathBuf, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn delivery(reason: impl Into<String>) -> Self {
        Self::Delivery {
            reason: reason.into(),
            retry_after: None,
            permanent: false,
        }
    }

    pub fn is_permanent_delivery(&self) -> bool {
        matches!(
            self,
            Self::Delivery {
                permanent: true,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
