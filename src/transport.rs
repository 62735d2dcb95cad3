//! Streamable HTTP transport: one instance per MCP session.
//!
//! A transport owns the session id once `initialize` has been answered, turns
//! POSTed JSON-RPC messages into engine calls, serves the server-to-client SSE
//! stream on GET, and closes itself on DELETE.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use crate::engine::Connection;
use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Header carrying the session id in both directions.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

const SSE_MESSAGE_EVENT: &str = "message";
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// An HTTP request as seen by the session layer: the framework has already
/// split off the query token and parsed the JSON body.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub query_token: Option<String>,
    pub body: Option<Value>,
}

impl IncomingRequest {
    pub fn new(
        method: Method,
        headers: HeaderMap,
        query_token: Option<String>,
        body: Option<Value>,
    ) -> Self {
        Self {
            method,
            headers,
            query_token,
            body,
        }
    }

    /// Value of the `mcp-session-id` header, if present and non-empty.
    pub fn session_id(&self) -> Option<&str> {
        self.headers
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// A session's open channel to the protocol engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Id assigned during initialization, if any.
    fn session_id(&self) -> Option<String>;

    async fn handle_request(&self, request: IncomingRequest) -> Result<Response, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

type SessionCallback = Box<dyn Fn(&str) + Send + Sync>;

pub struct StreamableHttpTransport {
    connection: Connection,
    session_id: OnceLock<String>,
    on_session_initialized: Option<SessionCallback>,
    on_close: Option<SessionCallback>,
    closed: AtomicBool,
    stream_open: Arc<AtomicBool>,
}

impl StreamableHttpTransport {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            session_id: OnceLock::new(),
            on_session_initialized: None,
            on_close: None,
            closed: AtomicBool::new(false),
            stream_open: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Called once with the freshly generated id, before the initialize
    /// response is produced.
    pub fn on_session_initialized(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_session_initialized = Some(Box::new(f));
        self
    }

    /// Called once when the transport closes, whatever triggered it.
    pub fn on_close(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn handle_post(&self, body: Option<Value>) -> Response {
        let Some(body) = body else {
            return rpc_response(
                StatusCode::BAD_REQUEST,
                JsonRpcResponse::error(None, JsonRpcError::parse_error()),
                None,
            );
        };

        if body.is_array() {
            return rpc_response(
                StatusCode::BAD_REQUEST,
                JsonRpcResponse::error(
                    None,
                    JsonRpcError::invalid_request_with("Batching not supported"),
                ),
                None,
            );
        }

        // Client replies to server-initiated requests carry no method.
        if body.get("method").is_none()
            && (body.get("result").is_some() || body.get("error").is_some())
        {
            return StatusCode::ACCEPTED.into_response();
        }

        let req: JsonRpcRequest = match serde_json::from_value(body) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "invalid JSON-RPC message");
                return rpc_response(
                    StatusCode::BAD_REQUEST,
                    JsonRpcResponse::error(None, JsonRpcError::invalid_request()),
                    None,
                );
            }
        };

        if req.method == "initialize" {
            if self.session_id.get().is_some() {
                return rpc_response(
                    StatusCode::BAD_REQUEST,
                    JsonRpcResponse::error(
                        req.id.clone(),
                        JsonRpcError::invalid_request_with(
                            "Invalid Request: Server already initialized",
                        ),
                    ),
                    None,
                );
            }
            self.assign_session_id();
        } else if self.session_id.get().is_none() {
            return rpc_response(
                StatusCode::BAD_REQUEST,
                JsonRpcResponse::error(req.id.clone(), JsonRpcError::server_not_initialized()),
                None,
            );
        }

        let session_id = self.session_id.get().map(String::as_str);
        match self.connection.handle(&req).await {
            Some(resp) => rpc_response(StatusCode::OK, resp, session_id),
            None => StatusCode::ACCEPTED.into_response(),
        }
    }

    fn assign_session_id(&self) {
        let id = uuid::Uuid::new_v4().to_string();
        if self.session_id.set(id.clone()).is_ok() {
            if let Some(cb) = &self.on_session_initialized {
                cb(&id);
            }
        }
    }

    fn handle_get(&self, headers: &HeaderMap) -> Response {
        let accepts_sse = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"));
        if !accepts_sse {
            return rpc_response(
                StatusCode::NOT_ACCEPTABLE,
                JsonRpcResponse::error(
                    None,
                    JsonRpcError::invalid_request_with(
                        "Not Acceptable: Client must accept text/event-stream",
                    ),
                ),
                None,
            );
        }

        if self.stream_open.swap(true, Ordering::SeqCst) {
            return rpc_response(
                StatusCode::CONFLICT,
                JsonRpcResponse::error(
                    None,
                    JsonRpcError::invalid_request_with(
                        "Conflict: Only one SSE stream is allowed per session",
                    ),
                ),
                None,
            );
        }
        let guard = StreamGuard(self.stream_open.clone());

        let Some(mut rx) = self.connection.subscribe() else {
            return StatusCode::GONE.into_response();
        };

        let stream = async_stream::stream! {
            let _guard = guard;
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        yield Ok::<_, Infallible>(Event::default().event(SSE_MESSAGE_EVENT).data(msg));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "SSE subscriber lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };

        let mut response = Sse::new(stream)
            .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
            .into_response();
        if let Some(v) = self
            .session_id
            .get()
            .and_then(|sid| HeaderValue::from_str(sid).ok())
        {
            response.headers_mut().insert(MCP_SESSION_ID_HEADER, v);
        }
        response
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn session_id(&self) -> Option<String> {
        self.session_id.get().cloned()
    }

    async fn handle_request(&self, request: IncomingRequest) -> Result<Response, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let response = match request.method {
            Method::POST => self.handle_post(request.body).await,
            Method::GET => self.handle_get(&request.headers),
            Method::DELETE => {
                self.close().await?;
                StatusCode::OK.into_response()
            }
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        };
        Ok(response)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.connection.close();
        if let (Some(cb), Some(sid)) = (&self.on_close, self.session_id.get()) {
            cb(sid);
        }
        Ok(())
    }
}

/// Clears the one-stream-per-session flag when the SSE stream is dropped.
struct StreamGuard(Arc<AtomicBool>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn rpc_response(status: StatusCode, body: JsonRpcResponse, session_id: Option<&str>) -> Response {
    let mut response = (status, Json(body)).into_response();
    if let Some(v) = session_id.and_then(|sid| HeaderValue::from_str(sid).ok()) {
        response.headers_mut().insert(MCP_SESSION_ID_HEADER, v);
    }
    response
}
