use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PresenceError {
    #[error("Failed to connect to Discord (ID: {client_id}): {reason}")]
    Connect { client_id: i64, reason: String },

    #[error("Failed to update activity: {0}")]
    Apply(String),

    #[error("Discord RPC is not connected")]
    NotConnected,
}
