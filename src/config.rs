//! Built-in defaults. The application can be swapped at build time through
//! `PRESENCE_CLIENT_ID`, `PRESENCE_APP_NAME` and `PRESENCE_APP_KEY`.

use std::time::Duration;

use chrono::TimeZone;

use crate::presence::{Binding, StatusPayload};

pub const DEFAULT_CLIENT_ID: i64 = 1_430_896_766_579_900_509;
pub const DEFAULT_APP_NAME: &str = "人生";
pub const DEFAULT_APP_KEY: &str = "life";

pub const DEFAULT_DETAILS: &str = "オンライン";
pub const DEFAULT_STATE: &str = "待機中...";
pub const DEFAULT_LARGE_IMAGE: &str = "main_icon";

pub const CONTROL_SERVER_ADDR: &str = "127.0.0.1:5000";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub fn get_client_id() -> i64 {
    if let Some(env) = option_env!("PRESENCE_CLIENT_ID") {
        env.parse().unwrap_or(DEFAULT_CLIENT_ID)
    } else {
        DEFAULT_CLIENT_ID
    }
}

pub fn get_app_name() -> String {
    option_env!("PRESENCE_APP_NAME")
        .unwrap_or(DEFAULT_APP_NAME)
        .to_string()
}

pub fn get_app_key() -> String {
    option_env!("PRESENCE_APP_KEY")
        .unwrap_or(DEFAULT_APP_KEY)
        .to_string()
}

pub fn default_binding() -> Binding {
    Binding {
        client_id: get_client_id(),
        app_name: get_app_name(),
        app_key: get_app_key(),
    }
}

/// 2000-01-01 00:00:00 in local time
pub fn default_start() -> i64 {
    chrono::Local
        .with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .earliest()
        .map_or(946_684_800, |dt| dt.timestamp())
}

pub fn default_status(start: i64) -> StatusPayload {
    StatusPayload {
        details: DEFAULT_DETAILS.to_string(),
        state: DEFAULT_STATE.to_string(),
        start,
        large_image: DEFAULT_LARGE_IMAGE.to_string(),
    }
}
