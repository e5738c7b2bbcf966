//! # HTTP Request Router
//!
//! Every request goes through one dispatch function so the rules apply in a
//! fixed order, first match wins:
//!
//! ```text
//!  1. GET /identify                 open, discovery envelope
//!  2. /, *.html, *.css, *.ico       open (info page, stylesheet, favicon)
//!  3. device-id header ≠ ours   ──► 403
//!  4. GET /ping
//!  5. GET /list                     MessagePack registry snapshot
//!  6. PUT /uninstall
//!  7. PUT /firmware                 ends the serve cycle on success
//!  8. sdk-version header ≠ ours ──► 406
//!  9. PUT /install
//! 10. PUT /run                      disabled mode ends the serve cycle
//!     anything else             ──► 404
//! ```
//!
//! A serve cycle ends when [`ServerState::stop_serving`] is called, either
//! by a handler or by the supervisor once the link is gone. The listener
//! stops accepting, in-flight responses finish, idle keep-alive connections
//! are closed, and [`serve`] returns only after every connection is done.

use crate::constants::{
    ATTR_DISABLED, ATTR_TIMEOUT, HEADER_CONTAINER_NAME, HEADER_CONTAINER_TIMEOUT,
    HEADER_DEVICE_ID, HEADER_DISABLED, HEADER_SDK_VERSION,
};
use crate::daemon::Daemon;
use crate::error::{Error, Result};
use crate::identity::DiscoveryMessage;
use crate::lifecycle::is_disabled;
use crate::registry::Attributes;
use crate::storage::Payload;
use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::{StreamExt, TryStreamExt};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where browsers asking for `favicon.ico` are sent.
pub const FAVICON_URL: &str = "https://toit.io/favicon.ico";

const STYLESHEET: &str = "body{font-family:sans-serif;margin:2em;color:#222}\
h1{font-size:1.4em}table{border-collapse:collapse}\
td,th{border:1px solid #ccc;padding:.3em .6em;text-align:left}";

// =============================================================================
// Server State
// =============================================================================

/// Per-cycle router state.
#[derive(Clone)]
pub struct ServerState {
    daemon: Arc<Daemon>,
    address: IpAddr,
    stop: Arc<watch::Sender<bool>>,
}

impl ServerState {
    /// State for one serve cycle on the interface at `address`.
    pub fn new(daemon: Arc<Daemon>, address: IpAddr) -> Self {
        Self {
            daemon,
            address,
            stop: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Ends the current serve cycle once in-flight responses are sent.
    pub fn stop_serving(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Builds the router for one serve cycle.
pub fn router(state: ServerState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

/// Serves `listener` until the cycle is stopped or the server fails.
pub async fn serve(listener: TcpListener, state: ServerState) -> Result<()> {
    let mut stopped = state.stop.subscribe();
    let local = listener.local_addr()?;
    info!(addr = %local, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = stopped.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| Error::Server(e.to_string()))?;

    info!(addr = %local, "HTTP server stopped");
    Ok(())
}

// =============================================================================
// Responses
// =============================================================================

/// Error response: status plus a human-readable message.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::new(e.http_status(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

fn ok() -> Response {
    Json(serde_json::json!({ "status": "OK" })).into_response()
}

/// OK response that also asks the client to drop the connection.
fn ok_and_close() -> Response {
    ([(header::CONNECTION, "close")], ok()).into_response()
}

// =============================================================================
// Dispatch
// =============================================================================

async fn dispatch(State(state): State<ServerState>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match route(&state, &method, &path, request).await {
        Ok(response) => {
            debug!(%method, %path, status = response.status().as_u16(), "request handled");
            response
        }
        Err(e) => {
            if e.status.is_server_error() {
                error!(%method, %path, status = e.status.as_u16(), message = %e.message, "request failed");
            } else {
                warn!(%method, %path, status = e.status.as_u16(), message = %e.message, "request rejected");
            }
            e.into_response()
        }
    }
}

async fn route(state: &ServerState, method: &Method, path: &str, request: Request) -> ApiResult {
    let daemon = &state.daemon;
    let identity = daemon.identity();

    if *method == Method::GET && path == "/identify" {
        let message = DiscoveryMessage::identify(&identity.payload(state.address))?;
        return Ok(Json(message).into_response());
    }

    if let Some(response) = static_page(state, path) {
        return Ok(response);
    }

    check_device_id(request.headers(), identity.id)?;

    match (method, path) {
        (&Method::GET, "/ping") => return Ok(ok()),
        (&Method::GET, "/list") => return list(state),
        (&Method::PUT, "/uninstall") => {
            let name = required_header(request.headers(), HEADER_CONTAINER_NAME)?;
            daemon.registry().uninstall(&name).await?;
            return Ok(ok());
        }
        (&Method::PUT, "/firmware") => {
            let size = content_length(request.headers());
            daemon.firmware().install(body_payload(request), size).await?;
            state.stop_serving();
            return Ok(ok_and_close());
        }
        _ => {}
    }

    check_sdk_version(request.headers(), &identity.sdk_version)?;

    match (method, path) {
        (&Method::PUT, "/install") => install(state, request).await,
        (&Method::PUT, "/run") => run(state, request).await,
        _ => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("no such endpoint: {} {}", method, path),
        )),
    }
}

// =============================================================================
// Validation
// =============================================================================

fn check_device_id(headers: &HeaderMap, expected: uuid::Uuid) -> std::result::Result<(), ApiError> {
    let presented = header_str(headers, HEADER_DEVICE_ID);
    let matches = presented
        .and_then(|value| uuid::Uuid::parse_str(value).ok())
        .is_some_and(|id| id == expected);
    if matches {
        return Ok(());
    }
    Err(ApiError::new(
        StatusCode::FORBIDDEN,
        format!(
            "device has id {}, request addressed to {}",
            expected,
            presented.unwrap_or("<none>")
        ),
    ))
}

fn check_sdk_version(headers: &HeaderMap, expected: &str) -> std::result::Result<(), ApiError> {
    let presented = header_str(headers, HEADER_SDK_VERSION);
    if presented == Some(expected) {
        return Ok(());
    }
    Err(ApiError::new(
        StatusCode::NOT_ACCEPTABLE,
        format!(
            "device has SDK version {}, client has {}",
            expected,
            presented.unwrap_or("<none>")
        ),
    ))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn required_header(headers: &HeaderMap, name: &'static str) -> Result<String> {
    header_str(headers, name)
        .map(str::to_string)
        .ok_or(Error::MissingHeader(name))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, header::CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok())
}

/// Builds container attributes from the optional request headers.
///
/// `disabled` counts by presence. A timeout that is not a positive integer
/// is dropped.
pub fn header_attributes(headers: &HeaderMap) -> Attributes {
    let mut attributes = Attributes::new();
    if headers.contains_key(HEADER_DISABLED) {
        attributes.insert(ATTR_DISABLED.to_string(), serde_json::Value::Bool(true));
    }
    if let Some(secs) = header_str(headers, HEADER_CONTAINER_TIMEOUT)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
    {
        attributes.insert(ATTR_TIMEOUT.to_string(), secs.into());
    }
    attributes
}

fn body_payload(request: Request) -> Payload {
    request
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other)
        .boxed()
}

// =============================================================================
// Handlers
// =============================================================================

fn list(state: &ServerState) -> ApiResult {
    let entries = state.daemon.registry().list();
    let body = rmp_serde::to_vec_named(&entries)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "application/x-msgpack")], body).into_response())
}

async fn install(state: &ServerState, request: Request) -> ApiResult {
    let daemon = &state.daemon;
    let name = required_header(request.headers(), HEADER_CONTAINER_NAME)?;
    let attributes = header_attributes(request.headers());
    let size = content_length(request.headers());

    let pin = daemon
        .registry()
        .install(Some(&name), attributes.clone(), body_payload(request), size)
        .await?;

    if is_disabled(&attributes) {
        info!(container = %name, "disabled-mode container installed, runs at next boot");
        return Ok(ok());
    }

    let instance = daemon.lifecycle().run(&pin, &attributes, &name).await?;
    daemon.lifecycle().spawn_to_completion(instance);
    Ok(ok())
}

async fn run(state: &ServerState, request: Request) -> ApiResult {
    let daemon = &state.daemon;
    let attributes = header_attributes(request.headers());
    let size = content_length(request.headers());
    let name = header_str(request.headers(), HEADER_CONTAINER_NAME).map(str::to_string);

    let pin = daemon
        .registry()
        .install(None, attributes.clone(), body_payload(request), size)
        .await?;
    let label = name.unwrap_or_else(|| format!("run-{}", pin.short()));

    if !is_disabled(&attributes) {
        let instance = daemon.lifecycle().run(&pin, &attributes, &label).await?;
        daemon.lifecycle().spawn_to_completion(instance);
        return Ok(ok());
    }

    let mut side = daemon.handshake().begin()?;
    let lifecycle = Arc::clone(daemon.lifecycle());
    tokio::spawn(async move {
        if let Err(e) = side.network_free().await {
            error!(container = %label, error = %e, "disabled-mode run abandoned");
            return;
        }
        match lifecycle.run(&pin, &attributes, &label).await {
            Ok(instance) => {
                let timeout = instance.timeout();
                drop(pin);
                lifecycle.run_to_completion(instance, timeout).await;
            }
            Err(e) => error!(container = %label, error = %e, "disabled-mode container failed to start"),
        }
        side.finish();
    });

    state.stop_serving();
    Ok(ok_and_close())
}

fn static_page(state: &ServerState, path: &str) -> Option<Response> {
    if path.ends_with(".ico") {
        return Some((StatusCode::FOUND, [(header::LOCATION, FAVICON_URL)]).into_response());
    }
    if path.ends_with(".css") {
        return Some(([(header::CONTENT_TYPE, "text/css")], STYLESHEET).into_response());
    }
    if path == "/" || path.ends_with(".html") {
        let body = info_page(&state.daemon);
        return Some(
            (
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                Body::from(body),
            )
                .into_response(),
        );
    }
    None
}

fn info_page(daemon: &Daemon) -> String {
    let identity = daemon.identity();
    let rows: String = daemon
        .registry()
        .list()
        .iter()
        .map(|entry| {
            format!(
                "<tr><td>{}</td><td>{}</td></tr>",
                escape(&entry.name),
                entry.image.short()
            )
        })
        .collect();

    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <link rel=\"stylesheet\" href=\"/style.css\"><title>{name}</title></head>\
         <body><h1>{name}</h1><p>SDK {sdk}</p>\
         <table><tr><th>Container</th><th>Image</th></tr>{rows}</table></body></html>",
        name = escape(&identity.name),
        sdk = escape(&identity.sdk_version),
        rows = rows,
    )
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
