use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not connected")]
    NotConnected,
    #[error("connection lost before acknowledgement")]
    Disconnected,
    #[error("rpc {method} failed: {message}")]
    Rpc { method: String, message: String },
    #[error("failed to decrypt {what}")]
    Decrypt { what: String },
    #[error("failed to encrypt {what}: {message}")]
    Encrypt { what: String, message: String },
    #[error("http error (status={status:?}): {message}")]
    Http { status: Option<u16>, message: String },
    #[error("version conflict on {field} after {attempts} attempts")]
    VersionConflict { field: String, attempts: u32 },
    #[error("unknown {kind} {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("protocol error: {message}")]
    Protocol { message: String },
}

impl SyncError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotConnected | Self::Disconnected => true,
            Self::Http { status, .. } => status.is_none_or(|s| s >= 500 || s == 429),
            _ => false,
        }
    }

    pub(crate) fn encrypt(what: impl Into<String>, err: anyhow::Error) -> Self {
        Self::Encrypt {
            what: what.into(),
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SyncError::Disconnected.is_transient());
        assert!(SyncError::NotConnected.is_transient());
        assert!(
            SyncError::Http {
                status: Some(503),
                message: "unavailable".into()
            }
            .is_transient()
        );
        assert!(
            !SyncError::Http {
                status: Some(404),
                message: "missing".into()
            }
            .is_transient()
        );
        assert!(
            !SyncError::VersionConflict {
                field: "metadata".into(),
                attempts: 5
            }
            .is_transient()
        );
    }
}
