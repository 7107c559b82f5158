mod error;
mod manager;
mod traits;

pub use error::PresenceError;
pub use manager::{start_heartbeat_background_task, ConnectionManager, Snapshot, UpdateRequest};
pub use traits::{Binding, ConnectionState, SessionClient, StatusPayload};

#[cfg(test)]
pub(crate) use manager::tests as testing;
