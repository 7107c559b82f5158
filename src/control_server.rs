use std::io::Read;
use std::sync::Arc;
use std::thread;

use serde_json::{json, Value};
use thiserror::Error;
use tiny_http::{Method, Response, Server};
use tokio::runtime::Handle;
use url::Url;

use crate::config::DEFAULT_LARGE_IMAGE;
use crate::presence::{ConnectionManager, SessionClient, UpdateRequest};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Request body must be a JSON object")]
    NotAnObject,

    #[error("details, state, app_key, app_name, client_id are required")]
    MissingFields,

    #[error("Invalid client_id, it must be a number")]
    InvalidClientId,

    #[error("Invalid start timestamp")]
    InvalidStart,
}

/// Status code and JSON body produced for one request
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

impl Reply {
    fn success(message: &str) -> Self {
        Self {
            status: 200,
            body: json!({"status": "success", "message": message}),
        }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({"status": "error", "message": message.into()}),
        }
    }
}

/// CORS headers so a browser control page can reach the endpoint
fn cors_headers() -> Vec<tiny_http::Header> {
    [
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
        ("Access-Control-Allow-Headers", "Content-Type"),
    ]
    .iter()
    .filter_map(|(name, value)| {
        tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
    })
    .collect()
}

/// Helper to create a JSON response with CORS headers
fn json_response(reply: &Reply) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut response = Response::from_string(reply.body.to_string()).with_status_code(reply.status);

    if let Ok(content_type) =
        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
    {
        response.add_header(content_type);
    }
    for header in cors_headers() {
        response.add_header(header);
    }

    response
}

/// Helper to create an empty response for OPTIONS preflight requests
fn preflight_response() -> Response<std::io::Empty> {
    let mut response = Response::empty(204);
    for header in cors_headers() {
        response.add_header(header);
    }
    response
}

/// Loopback HTTP server that lets local tools change the presence
pub struct ControlServer {
    server: Arc<Server>,
}

impl ControlServer {
    pub fn start<C>(
        addr: &str,
        manager: Arc<ConnectionManager<C>>,
        runtime: Handle,
    ) -> Result<Self, String>
    where
        C: SessionClient + 'static,
    {
        let server = Server::http(addr)
            .map_err(|e| format!("Failed to start control server on {}: {}", addr, e))?;

        let port = server
            .server_addr()
            .to_ip()
            .ok_or("Failed to get server address")?
            .port();

        tracing::info!("Control server started on http://127.0.0.1:{}", port);

        let server = Arc::new(server);
        let server_clone = Arc::clone(&server);

        thread::spawn(move || {
            Self::run_server(&server_clone, &manager, &runtime);
        });

        Ok(Self { server })
    }

    /// Stop accepting requests and let the server thread finish
    pub fn stop(&self) {
        self.server.unblock();
    }

    fn run_server<C>(server: &Server, manager: &Arc<ConnectionManager<C>>, runtime: &Handle)
    where
        C: SessionClient + 'static,
    {
        for mut request in server.incoming_requests() {
            // Handle CORS preflight requests
            if request.method() == &Method::Options {
                request.respond(preflight_response()).ok();
                continue;
            }

            let full_url = format!("http://127.0.0.1{}", request.url());
            let url = match Url::parse(&full_url) {
                Ok(url) => url,
                Err(e) => {
                    tracing::error!("Failed to parse control server URL: {}", e);
                    request.respond(json_response(&Reply::error(400, e.to_string()))).ok();
                    continue;
                }
            };

            let mut body = String::new();
            if let Err(e) = request.as_reader().read_to_string(&mut body) {
                tracing::warn!("Failed to read request body: {}", e);
                request
                    .respond(json_response(&Reply::error(400, "Unreadable request body")))
                    .ok();
                continue;
            }

            tracing::debug!("Control server received {} {}", request.method(), url.path());

            let method = request.method().clone();
            let reply = runtime.block_on(route(manager, &method, url.path(), &body));
            request.respond(json_response(&reply)).ok();
        }

        tracing::info!("Control server stopped");
    }
}

/// Dispatch one request to its handler
pub async fn route<C>(
    manager: &Arc<ConnectionManager<C>>,
    method: &Method,
    path: &str,
    body: &str,
) -> Reply
where
    C: SessionClient + 'static,
{
    match (path, method) {
        ("/update", Method::Post) => handle_update(manager, body).await,
        ("/status", Method::Get) => handle_status(manager).await,
        ("/update" | "/status", _) => Reply::error(405, "Method not allowed"),
        _ => Reply::error(404, "Not found"),
    }
}

async fn handle_update<C>(manager: &Arc<ConnectionManager<C>>, body: &str) -> Reply
where
    C: SessionClient + 'static,
{
    let request = match parse_update(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!("Rejected update: {}", e);
            return Reply::error(400, e.to_string());
        }
    };

    // Run on its own task so a panic inside the update is contained here
    let task = {
        let manager = Arc::clone(manager);
        tokio::spawn(async move { manager.update(request).await })
    };

    match task.await {
        Ok(Ok(())) => Reply::success("Activity updated"),
        Ok(Err(e)) => {
            tracing::error!("Update failed: {}", e);
            Reply::error(500, e.to_string())
        }
        Err(e) => {
            tracing::error!("RPC update error: {}. Resetting connection.", e);
            manager.recover().await;
            Reply::error(500, format!("RPC update error: {}", e))
        }
    }
}

async fn handle_status<C>(manager: &Arc<ConnectionManager<C>>) -> Reply
where
    C: SessionClient + 'static,
{
    let snapshot = manager.snapshot().await;
    Reply {
        status: 200,
        body: json!({
            "status": "success",
            "binding": snapshot.binding,
            "payload": snapshot.payload,
            "connection": snapshot.connection,
            "start": snapshot.start,
        }),
    }
}

pub fn parse_update(body: &str) -> Result<UpdateRequest, ValidationError> {
    let data: Value = serde_json::from_str(body).map_err(|_| ValidationError::NotAnObject)?;
    let data = data.as_object().ok_or(ValidationError::NotAnObject)?;

    let text = |key: &str| -> Result<String, ValidationError> {
        match data.get(key) {
            None | Some(Value::Null) => Err(ValidationError::MissingFields),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
        }
    };

    let details = text("details")?;
    let state = text("state")?;
    let app_key = text("app_key")?;
    let app_name = text("app_name")?;

    let client_id = match data.get("client_id") {
        None | Some(Value::Null) => return Err(ValidationError::MissingFields),
        Some(value) => parse_integer(value).ok_or(ValidationError::InvalidClientId)?,
    };

    let start = match data.get("start") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(value) => Some(parse_integer(value).ok_or(ValidationError::InvalidStart)?),
    };

    let large_image = match data.get("large_image") {
        None | Some(Value::Null) => DEFAULT_LARGE_IMAGE.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };

    Ok(UpdateRequest {
        details,
        state,
        app_key,
        app_name,
        client_id,
        start,
        large_image,
    })
}

/// Accepts JSON integers and numeric strings
fn parse_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
