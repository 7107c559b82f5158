use async_trait::async_trait;
use serde::Serialize;

use super::error::PresenceError;

/// Which remote application the session currently represents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub client_id: i64,
    pub app_name: String,
    /// Caller-side label for the application ("life", a UUID, ...)
    pub app_key: String,
}

/// The content shown on the remote side
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusPayload {
    pub details: String,
    pub state: String,
    /// Epoch seconds
    pub start: i64,
    pub large_image: String,
}

/// Lifecycle of the session handle. Loss of a connected session is only
/// noticed when the next push fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Trait for the remote presence service the manager talks to
#[async_trait]
pub trait SessionClient: Send + Sync {
    type Handle: Send;

    /// Returns the name of this client (for logging)
    fn name(&self) -> &'static str;

    /// Open a session for the given application id
    async fn open(&self, client_id: i64) -> Result<Self::Handle, PresenceError>;

    /// Push a status over an open session. A dead session surfaces here as
    /// [`PresenceError::Apply`].
    async fn push(
        &self,
        handle: &mut Self::Handle,
        binding: &Binding,
        payload: &StatusPayload,
    ) -> Result<(), PresenceError>;

    /// Close a session. Callers treat failures as ignorable.
    async fn close(&self, handle: Self::Handle) -> Result<(), PresenceError>;
}
