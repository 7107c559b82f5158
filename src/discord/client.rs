//! Discord Rich Presence session client using discord-sdk

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use discord_sdk::{
    activity::{ActivityBuilder, Assets},
    wheel::{UserSpoke, UserState, Wheel},
    Discord, Subscriptions,
};

use crate::presence::{Binding, PresenceError, SessionClient, StatusPayload};

/// Timeout for waiting for Discord handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a single activity update
const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// An open IPC connection to the local Discord client
pub struct DiscordSession {
    discord: Discord,
    user: UserSpoke,
    _wheel: Wheel,
}

/// Opens Discord sessions and pushes activities over them
#[derive(Debug, Default)]
pub struct DiscordClient;

impl DiscordClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionClient for DiscordClient {
    type Handle = DiscordSession;

    fn name(&self) -> &'static str {
        "Discord"
    }

    async fn open(&self, client_id: i64) -> Result<DiscordSession, PresenceError> {
        let connect_error = |reason: String| PresenceError::Connect { client_id, reason };

        let (wheel, handler) = Wheel::new(Box::new(|err| {
            tracing::warn!("Discord error: {:?}", err);
        }));

        let mut user_spoke = wheel.user();

        let discord = Discord::new(client_id, Subscriptions::ACTIVITY, Box::new(handler))
            .map_err(|e| connect_error(format!("Discord not available: {:?}", e)))?;

        tracing::debug!("Discord connecting (ID: {})...", client_id);

        let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            if user_spoke.0.changed().await.is_err() {
                Err("Discord connection closed".to_string())
            } else {
                match &*user_spoke.0.borrow() {
                    UserState::Connected(user) => Ok(user.clone()),
                    UserState::Disconnected(err) => Err(format!("Discord disconnected: {:?}", err)),
                }
            }
        })
        .await;

        let user = match handshake {
            Ok(Ok(user)) => user,
            Ok(Err(e)) => {
                discord.disconnect().await;
                return Err(connect_error(e));
            }
            Err(_) => {
                discord.disconnect().await;
                return Err(connect_error("Discord handshake timed out".to_string()));
            }
        };

        tracing::info!(
            "Discord Rich Presence connected as {}#{}",
            user.username,
            user.discriminator.unwrap_or(0)
        );

        Ok(DiscordSession {
            discord,
            user: user_spoke,
            _wheel: wheel,
        })
    }

    async fn push(
        &self,
        handle: &mut DiscordSession,
        binding: &Binding,
        payload: &StatusPayload,
    ) -> Result<(), PresenceError> {
        let lost = match &*handle.user.0.borrow() {
            UserState::Connected(_) => None,
            UserState::Disconnected(err) => Some(format!("Discord disconnected: {:?}", err)),
        };
        if let Some(reason) = lost {
            return Err(PresenceError::Apply(reason));
        }

        let activity = ActivityBuilder::new()
            .details(payload.details.as_str())
            .state(payload.state.as_str())
            .start_timestamp(epoch_to_system_time(payload.start))
            .assets(Assets::default().large(
                payload.large_image.as_str(),
                Some::<&str>(binding.app_name.as_str()),
            ));

        match tokio::time::timeout(UPDATE_TIMEOUT, handle.discord.update_activity(activity)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(PresenceError::Apply(format!("{:?}", e))),
            Err(_) => Err(PresenceError::Apply(
                "Discord did not answer the activity update in time".to_string(),
            )),
        }
    }

    async fn close(&self, handle: DiscordSession) -> Result<(), PresenceError> {
        handle.discord.disconnect().await;
        tracing::debug!("Discord Rich Presence disconnected");
        Ok(())
    }
}

fn epoch_to_system_time(secs: i64) -> SystemTime {
    let offset = Duration::from_secs(secs.unsigned_abs());
    let time = if secs >= 0 {
        UNIX_EPOCH.checked_add(offset)
    } else {
        UNIX_EPOCH.checked_sub(offset)
    };
    time.unwrap_or(UNIX_EPOCH)
}
