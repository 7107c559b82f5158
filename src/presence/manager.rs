//! Owns the single presence session and serializes every operation on it

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::error::PresenceError;
use super::traits::{Binding, ConnectionState, SessionClient, StatusPayload};

/// A status change requested by a caller, already validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub details: String,
    pub state: String,
    pub app_key: String,
    pub app_name: String,
    pub client_id: i64,
    /// Replaces the remembered start time for this and every later apply
    pub start: Option<i64>,
    pub large_image: String,
}

/// Consistent view of the manager state, taken under the lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub binding: Binding,
    pub payload: Option<StatusPayload>,
    pub connection: ConnectionState,
    pub start: i64,
}

struct SessionState<H> {
    handle: Option<H>,
    connection: ConnectionState,
    binding: Binding,
    payload: Option<StatusPayload>,
    start: i64,
}

/// Manages the presence session, its binding and the last applied status
pub struct ConnectionManager<C: SessionClient> {
    client: C,
    session: Mutex<SessionState<C::Handle>>,
}

impl<C: SessionClient> ConnectionManager<C> {
    /// Create a disconnected manager targeting `binding`. Nothing is opened
    /// until the first `bind`, `apply` or `heartbeat`.
    pub fn new(client: C, binding: Binding, start: i64) -> Self {
        Self {
            client,
            session: Mutex::new(SessionState {
                handle: None,
                connection: ConnectionState::Disconnected,
                binding,
                payload: None,
                start,
            }),
        }
    }

    /// Drop the current session and open a new one for `client_id`.
    ///
    /// The new binding is recorded even when opening fails, so a later
    /// `apply` or heartbeat reconnects to it.
    pub async fn bind(&self, client_id: i64, app_name: &str) -> Result<(), PresenceError> {
        let mut guard = self.session.lock().await;
        let session = &mut *guard;
        let binding = Binding {
            client_id,
            app_name: app_name.to_string(),
            app_key: session.binding.app_key.clone(),
        };
        self.connect(session, binding).await
    }

    /// Push `payload` and remember it for the heartbeat.
    pub async fn apply(&self, payload: StatusPayload) -> Result<(), PresenceError> {
        let mut guard = self.session.lock().await;
        self.apply_locked(&mut guard, payload).await
    }

    /// Rebind if the request targets another application, then apply its
    /// status, all under one lock.
    pub async fn update(&self, request: UpdateRequest) -> Result<(), PresenceError> {
        let mut guard = self.session.lock().await;
        let session = &mut *guard;

        if let Some(start) = request.start {
            session.start = start;
            tracing::info!("Start time updated to {}", format_timestamp(start));
        }

        if request.client_id == session.binding.client_id {
            session.binding.app_key = request.app_key;
            session.binding.app_name = request.app_name;
        } else {
            tracing::info!(
                "Switching application {} -> {} (ID: {})",
                session.binding.app_name,
                request.app_name,
                request.client_id
            );
            let binding = Binding {
                client_id: request.client_id,
                app_name: request.app_name,
                app_key: request.app_key,
            };
            self.connect(session, binding).await?;
        }

        let payload = StatusPayload {
            details: request.details,
            state: request.state,
            start: session.start,
            large_image: request.large_image,
        };
        let summary = format!(
            "Details={}, State={}, Image={}",
            payload.details, payload.state, payload.large_image
        );
        self.apply_locked(session, payload).await?;

        tracing::info!("Updated from web: App={}, {}", session.binding.app_name, summary);
        Ok(())
    }

    /// Re-send the last applied status. A failed push (or a missing session)
    /// triggers one reconnect and one retry; anything beyond that is logged.
    pub async fn heartbeat(&self) {
        let mut guard = self.session.lock().await;
        let session = &mut *guard;

        let Some(payload) = session.payload.clone() else {
            tracing::debug!("Heartbeat skipped, no status applied yet");
            return;
        };

        let first = match session.handle.as_mut() {
            Some(handle) => self.client.push(handle, &session.binding, &payload).await,
            None => Err(PresenceError::NotConnected),
        };

        let Err(e) = first else {
            tracing::debug!("Heartbeat sent for {}", session.binding.app_name);
            return;
        };

        tracing::warn!("Heartbeat failed (connection lost: {}), reconnecting...", e);

        let binding = session.binding.clone();
        if let Err(e) = self.connect(session, binding).await {
            tracing::warn!("Reconnect during heartbeat failed: {}", e);
            return;
        }

        let retry = match session.handle.as_mut() {
            Some(handle) => self.client.push(handle, &session.binding, &payload).await,
            None => Err(PresenceError::NotConnected),
        };

        match retry {
            Ok(()) => tracing::info!("Reconnected and restored status"),
            Err(e) => tracing::warn!("Update after reconnect failed: {}", e),
        }
    }

    /// Best-effort reconnect to the current binding
    pub async fn recover(&self) {
        let mut guard = self.session.lock().await;
        let session = &mut *guard;
        let binding = session.binding.clone();
        if let Err(e) = self.connect(session, binding).await {
            tracing::warn!("Recovery reconnect failed: {}", e);
        }
    }

    /// Close the session if one is open
    pub async fn shutdown(&self) {
        let mut guard = self.session.lock().await;
        let session = &mut *guard;
        if let Some(handle) = session.handle.take() {
            match self.client.close(handle).await {
                Ok(()) => tracing::info!("{} session closed", self.client.name()),
                Err(e) => tracing::warn!("Error while closing session (ignored): {}", e),
            }
        }
        session.connection = ConnectionState::Disconnected;
    }

    pub async fn snapshot(&self) -> Snapshot {
        let session = self.session.lock().await;
        Snapshot {
            binding: session.binding.clone(),
            payload: session.payload.clone(),
            connection: session.connection,
            start: session.start,
        }
    }

    #[cfg(test)]
    pub(crate) fn client(&self) -> &C {
        &self.client
    }

    #[cfg(test)]
    pub(crate) async fn connection_state(&self) -> ConnectionState {
        self.session.lock().await.connection
    }

    async fn connect(
        &self,
        session: &mut SessionState<C::Handle>,
        binding: Binding,
    ) -> Result<(), PresenceError> {
        if let Some(handle) = session.handle.take() {
            match self.client.close(handle).await {
                Ok(()) => tracing::info!("Closed previous {} session", self.client.name()),
                Err(e) => tracing::warn!("Error while closing session (ignored): {}", e),
            }
        }

        session.binding = binding;
        session.connection = ConnectionState::Connecting;

        match self.client.open(session.binding.client_id).await {
            Ok(handle) => {
                session.handle = Some(handle);
                session.connection = ConnectionState::Connected;
                tracing::info!(
                    "{} connected (App: {}, ID: {})",
                    self.client.name(),
                    session.binding.app_name,
                    session.binding.client_id
                );
                Ok(())
            }
            Err(e) => {
                session.connection = ConnectionState::Disconnected;
                tracing::error!("{}", e);
                Err(e)
            }
        }
    }

    async fn apply_locked(
        &self,
        session: &mut SessionState<C::Handle>,
        payload: StatusPayload,
    ) -> Result<(), PresenceError> {
        if session.handle.is_none() {
            tracing::warn!("Not connected, attempting to reconnect...");
            let binding = session.binding.clone();
            if self.connect(session, binding).await.is_err() {
                return Err(PresenceError::NotConnected);
            }
        }

        let Some(handle) = session.handle.as_mut() else {
            return Err(PresenceError::NotConnected);
        };

        self.client.push(handle, &session.binding, &payload).await?;
        session.payload = Some(payload);
        Ok(())
    }
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.with_timezone(&chrono::Local).to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Spawn the loop that replays the current status every `interval`
pub fn start_heartbeat_background_task<C>(
    manager: Arc<ConnectionManager<C>>,
    interval: Duration,
) -> JoinHandle<()>
where
    C: SessionClient + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            manager.heartbeat().await;
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Open(i64),
        Push(i64, String),
        Close(i64),
    }

    #[derive(Debug, Clone, Copy)]
    enum PushOutcome {
        Fail,
        Panic,
    }

    #[derive(Default)]
    struct FakeState {
        calls: Vec<Call>,
        open_results: VecDeque<bool>,
        push_outcomes: VecDeque<PushOutcome>,
    }

    /// In-memory session client. Every call succeeds unless a failure has
    /// been queued with `fail_next_open`, `fail_next_push` or
    /// `panic_next_push`. Clones share the same call log.
    #[derive(Default, Clone)]
    pub(crate) struct FakeClient {
        state: Arc<StdMutex<FakeState>>,
    }

    pub(crate) struct FakeHandle {
        client_id: i64,
    }

    impl FakeClient {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.state.lock().unwrap().calls.clone()
        }

        pub(crate) fn clear_calls(&self) {
            self.state.lock().unwrap().calls.clear();
        }

        pub(crate) fn fail_next_open(&self) {
            self.state.lock().unwrap().open_results.push_back(false);
        }

        pub(crate) fn fail_next_push(&self) {
            self.state
                .lock()
                .unwrap()
                .push_outcomes
                .push_back(PushOutcome::Fail);
        }

        pub(crate) fn panic_next_push(&self) {
            self.state
                .lock()
                .unwrap()
                .push_outcomes
                .push_back(PushOutcome::Panic);
        }
    }

    #[async_trait]
    impl SessionClient for FakeClient {
        type Handle = FakeHandle;

        fn name(&self) -> &'static str {
            "Fake"
        }

        async fn open(&self, client_id: i64) -> Result<FakeHandle, PresenceError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Open(client_id));
            if state.open_results.pop_front().unwrap_or(true) {
                Ok(FakeHandle { client_id })
            } else {
                Err(PresenceError::Connect {
                    client_id,
                    reason: "refused".to_string(),
                })
            }
        }

        async fn push(
            &self,
            handle: &mut FakeHandle,
            _binding: &Binding,
            payload: &StatusPayload,
        ) -> Result<(), PresenceError> {
            let outcome = {
                let mut state = self.state.lock().unwrap();
                state
                    .calls
                    .push(Call::Push(handle.client_id, payload.details.clone()));
                state.push_outcomes.pop_front()
            };
            match outcome {
                None => Ok(()),
                Some(PushOutcome::Fail) => Err(PresenceError::Apply("pipe closed".to_string())),
                Some(PushOutcome::Panic) => panic!("activity payload rejected by client"),
            }
        }

        async fn close(&self, handle: FakeHandle) -> Result<(), PresenceError> {
            self.state
                .lock()
                .unwrap()
                .calls
                .push(Call::Close(handle.client_id));
            Ok(())
        }
    }

    pub(crate) fn binding(client_id: i64, app_name: &str) -> Binding {
        Binding {
            client_id,
            app_name: app_name.to_string(),
            app_key: "life".to_string(),
        }
    }

    fn payload(details: &str) -> StatusPayload {
        StatusPayload {
            details: details.to_string(),
            state: "idle".to_string(),
            start: 946_684_800,
            large_image: "main_icon".to_string(),
        }
    }

    pub(crate) fn request(client_id: i64, details: &str) -> UpdateRequest {
        UpdateRequest {
            details: details.to_string(),
            state: "B".to_string(),
            app_key: "life".to_string(),
            app_name: format!("App {}", client_id),
            client_id,
            start: None,
            large_image: "main_icon".to_string(),
        }
    }

    fn manager() -> ConnectionManager<FakeClient> {
        ConnectionManager::new(FakeClient::default(), binding(1, "Default"), 946_684_800)
    }

    #[tokio::test]
    async fn test_bind_then_apply_opens_once_and_pushes() {
        let manager = manager();

        manager.bind(42, "Life").await.unwrap();
        manager.apply(payload("A")).await.unwrap();

        assert_eq!(
            manager.client.calls(),
            vec![Call::Open(42), Call::Push(42, "A".to_string())]
        );
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.binding.client_id, 42);
        assert_eq!(snapshot.binding.app_name, "Life");
        assert_eq!(snapshot.connection, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_heartbeat_replays_latest_successful_apply() {
        let manager = manager();
        manager.bind(1, "Default").await.unwrap();

        manager.apply(payload("first")).await.unwrap();
        manager.apply(payload("second")).await.unwrap();
        manager.client.fail_next_push();
        assert!(manager.apply(payload("rejected")).await.is_err());

        manager.client.clear_calls();
        manager.heartbeat().await;

        assert_eq!(
            manager.client.calls(),
            vec![Call::Push(1, "second".to_string())]
        );
    }

    #[tokio::test]
    async fn test_heartbeat_reconnects_once_and_retries() {
        let manager = manager();
        manager.bind(1, "Default").await.unwrap();
        manager.apply(payload("A")).await.unwrap();
        manager.client.clear_calls();

        manager.client.fail_next_push();
        manager.heartbeat().await;

        assert_eq!(
            manager.client.calls(),
            vec![
                Call::Push(1, "A".to_string()),
                Call::Close(1),
                Call::Open(1),
                Call::Push(1, "A".to_string()),
            ]
        );
        assert_eq!(manager.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_heartbeat_swallows_failed_retry() {
        let manager = manager();
        manager.bind(1, "Default").await.unwrap();
        manager.apply(payload("A")).await.unwrap();
        manager.client.clear_calls();

        manager.client.fail_next_push();
        manager.client.fail_next_push();
        manager.heartbeat().await;

        let pushes = manager
            .client
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Push(..)))
            .count();
        let opens = manager
            .client
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Open(..)))
            .count();
        assert_eq!(pushes, 2);
        assert_eq!(opens, 1);
        assert_eq!(manager.snapshot().await.payload, Some(payload("A")));
    }

    #[tokio::test]
    async fn test_heartbeat_reconnects_when_session_missing() {
        let manager = manager();
        manager.bind(1, "Default").await.unwrap();
        manager.apply(payload("A")).await.unwrap();
        manager.shutdown().await;
        manager.client.clear_calls();

        manager.heartbeat().await;

        assert_eq!(
            manager.client.calls(),
            vec![Call::Open(1), Call::Push(1, "A".to_string())]
        );
    }

    #[tokio::test]
    async fn test_heartbeat_without_payload_does_nothing() {
        let manager = manager();
        manager.heartbeat().await;
        assert!(manager.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_bind_keeps_intended_binding() {
        let manager = manager();
        manager.client.fail_next_open();

        let result = manager.bind(7, "Seven").await;

        assert!(matches!(result, Err(PresenceError::Connect { client_id: 7, .. })));
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.binding.client_id, 7);
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_apply_reconnects_implicitly() {
        let manager = manager();

        manager.apply(payload("A")).await.unwrap();

        assert_eq!(
            manager.client.calls(),
            vec![Call::Open(1), Call::Push(1, "A".to_string())]
        );
    }

    #[tokio::test]
    async fn test_apply_reports_not_connected_when_reconnect_fails() {
        let manager = manager();
        manager.client.fail_next_open();

        let result = manager.apply(payload("A")).await;

        assert_eq!(result, Err(PresenceError::NotConnected));
        assert_eq!(manager.client.calls(), vec![Call::Open(1)]);
        assert_eq!(manager.snapshot().await.payload, None);
    }

    #[tokio::test]
    async fn test_apply_surfaces_push_failure_without_retry() {
        let manager = manager();
        manager.bind(1, "Default").await.unwrap();
        manager.client.clear_calls();
        manager.client.fail_next_push();

        let result = manager.apply(payload("A")).await;

        assert!(matches!(result, Err(PresenceError::Apply(_))));
        assert_eq!(manager.client.calls(), vec![Call::Push(1, "A".to_string())]);
    }

    #[tokio::test]
    async fn test_update_binds_new_client_before_applying() {
        let manager = manager();
        manager.bind(1, "Default").await.unwrap();
        manager.client.clear_calls();

        manager.update(request(123, "A")).await.unwrap();

        assert_eq!(
            manager.client.calls(),
            vec![
                Call::Close(1),
                Call::Open(123),
                Call::Push(123, "A".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_update_same_client_does_not_reconnect() {
        let manager = manager();
        manager.bind(1, "Default").await.unwrap();
        manager.client.clear_calls();

        let mut req = request(1, "A");
        req.app_name = "Renamed".to_string();
        manager.update(req).await.unwrap();

        assert_eq!(manager.client.calls(), vec![Call::Push(1, "A".to_string())]);
        assert_eq!(manager.snapshot().await.binding.app_name, "Renamed");
    }

    #[tokio::test]
    async fn test_update_start_is_remembered_for_later_applies() {
        let manager = manager();

        let mut req = request(1, "A");
        req.start = Some(1_700_000_000);
        manager.update(req).await.unwrap();
        manager.update(request(2, "B")).await.unwrap();

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.start, 1_700_000_000);
        assert_eq!(snapshot.payload.map(|p| p.start), Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_update_refuses_apply_after_failed_bind() {
        let manager = manager();
        manager.bind(1, "Default").await.unwrap();
        manager.client.clear_calls();
        manager.client.fail_next_open();

        let result = manager.update(request(9, "A")).await;

        assert!(matches!(result, Err(PresenceError::Connect { .. })));
        assert_eq!(manager.client.calls(), vec![Call::Close(1), Call::Open(9)]);
        assert_eq!(manager.snapshot().await.binding.client_id, 9);
    }

    #[tokio::test]
    async fn test_two_switches_close_first_session_once() {
        let manager = manager();

        manager.update(request(10, "first")).await.unwrap();
        manager.update(request(20, "second")).await.unwrap();

        let calls = manager.client.calls();
        let closes_of_first = calls.iter().filter(|c| **c == Call::Close(10)).count();
        assert_eq!(closes_of_first, 1);

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.binding.client_id, 20);
        assert_eq!(snapshot.payload.map(|p| p.details), Some("second".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let manager = manager();
        manager.bind(1, "Default").await.unwrap();

        manager.shutdown().await;
        manager.shutdown().await;

        let closes = manager
            .client
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Close(_)))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(
            manager.connection_state().await,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_never_expose_partial_state() {
        let manager = Arc::new(manager());
        let mut tasks = Vec::new();

        for i in 1..=20_i64 {
            let m = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                m.update(request(i, &i.to_string())).await.unwrap();
            }));
            let m = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                m.heartbeat().await;
                let snapshot = m.snapshot().await;
                if let Some(payload) = snapshot.payload {
                    assert_eq!(payload.details, snapshot.binding.client_id.to_string());
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_task_ticks_on_interval() {
        let manager = Arc::new(manager());
        manager.apply(payload("A")).await.unwrap();
        manager.client.clear_calls();

        let task =
            start_heartbeat_background_task(Arc::clone(&manager), Duration::from_secs(15));

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert!(manager.client.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(32)).await;
        let pushes = manager
            .client
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Push(..)))
            .count();
        assert_eq!(pushes, 3);

        task.abort();
    }
}
