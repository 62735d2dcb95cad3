//! Session lifecycle manager.
//!
//! [`McpServer`] authenticates every request, creates sessions on
//! `initialize`, forwards session-scoped requests to the owning transport and
//! tears sessions down on DELETE, on transport closure, or on [`McpServer::close`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::engine::{EngineError, ProtocolEngine, ServerInfo};
use crate::protocol::{is_initialize_request, JsonRpcError, JsonRpcResponse};
use crate::registry::{ToolDescriptor, ToolRegistry, DEFAULT_TOOL_TIMEOUT};
use crate::session::SessionTable;
use crate::transport::{IncomingRequest, StreamableHttpTransport, Transport, TransportError};

const DEFAULT_SERVER_NAME: &str = "mcp-server";
const DEFAULT_SERVER_VERSION: &str = "0.0.0";

#[derive(Debug, Clone)]
pub struct McpServerOptions {
    pub name: Option<String>,
    pub version: Option<String>,
    pub token: String,
    pub tool_timeout: Duration,
}

impl McpServerOptions {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            name: None,
            version: None,
            token: token.into(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

impl From<&ServerConfig> for McpServerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            name: config.server_name.clone(),
            version: config.server_version.clone(),
            token: config.token.clone(),
            tool_timeout: config.tool_timeout,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("options.token is required")]
    MissingToken,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Bad Request")]
    MissingSessionId,
    #[error("Bad Request")]
    SessionNotFound(String),
    #[error("Bad Request")]
    BadRequest,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::MissingSessionId | Self::SessionNotFound(_) | Self::BadRequest => {
                StatusCode::BAD_REQUEST
            }
            Self::MissingToken | Self::Engine(_) | Self::Transport(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn log(&self, method: &Method) {
        match self {
            Self::Unauthorized => tracing::warn!(%method, "invalid token"),
            Self::MissingSessionId => {
                tracing::warn!(%method, "header \"mcp-session-id\" is required")
            }
            Self::SessionNotFound(sid) => {
                tracing::warn!(%method, session_id = %sid, "MCP session not found")
            }
            Self::BadRequest => tracing::warn!(%method, "not an initialize request and no session"),
            other => tracing::error!(%method, error = %other, "request failed"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(JsonRpcResponse::protocol_error(self.to_string(), None)),
        )
            .into_response()
    }
}

pub struct McpServer {
    auth: Authenticator,
    engine: Arc<ProtocolEngine>,
    sessions: Arc<SessionTable>,
}

impl McpServer {
    pub fn new(options: McpServerOptions) -> Result<Self, ServerError> {
        if options.token.is_empty() {
            return Err(ServerError::MissingToken);
        }

        let info = ServerInfo {
            name: options.name.unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string()),
            version: options
                .version
                .unwrap_or_else(|| DEFAULT_SERVER_VERSION.to_string()),
        };
        let registry = Arc::new(ToolRegistry::new(options.tool_timeout));

        Ok(Self {
            auth: Authenticator::new(options.token),
            engine: Arc::new(ProtocolEngine::new(info, registry)),
            sessions: Arc::new(SessionTable::new()),
        })
    }

    /// Register a tool. Intended to run before the server accepts traffic.
    pub fn add_tool(&self, descriptor: ToolDescriptor) {
        self.engine.registry().add_tool(descriptor);
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.engine.registry()
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// GET: open the server-to-client stream of an existing session.
    pub async fn handle_get(&self, request: IncomingRequest) -> Response {
        tracing::info!(
            session_id = request.session_id().unwrap_or("(empty session)"),
            "GET request received"
        );
        let method = request.method.clone();
        match self.try_get(request).await {
            Ok(response) => response,
            Err(e) => {
                e.log(&method);
                e.into_response()
            }
        }
    }

    async fn try_get(&self, request: IncomingRequest) -> Result<Response, ServerError> {
        self.authorize(&request)?;

        let sid = request.session_id().ok_or(ServerError::MissingSessionId)?;
        let transport = self
            .sessions
            .get(sid)
            .ok_or_else(|| ServerError::SessionNotFound(sid.to_string()))?;

        tracing::info!(session_id = %sid, "MCP session stream established");
        Ok(transport.handle_request(request).await?)
    }

    /// POST: start a session with `initialize`, or carry a message for an
    /// existing one.
    pub async fn handle_post(&self, request: IncomingRequest) -> Response {
        tracing::info!(
            session_id = request.session_id().unwrap_or("(empty session)"),
            body = ?request.body,
            "POST request received"
        );
        let method = request.method.clone();
        match self.try_post(request).await {
            Ok(response) => response,
            Err(e) => {
                e.log(&method);
                e.into_response()
            }
        }
    }

    async fn try_post(&self, request: IncomingRequest) -> Result<Response, ServerError> {
        self.authorize(&request)?;

        if let Some(sid) = request.session_id() {
            let transport = self
                .sessions
                .get(sid)
                .ok_or_else(|| ServerError::SessionNotFound(sid.to_string()))?;
            return Ok(transport.handle_request(request).await?);
        }

        if !request.body.as_ref().is_some_and(is_initialize_request) {
            return Err(ServerError::BadRequest);
        }

        let transport = self.open_transport()?;
        let response = transport.handle_request(request).await?;

        if let Some(sid) = transport.session_id() {
            self.sessions.ensure_registered(&sid, transport);
        }
        Ok(response)
    }

    /// Build a transport bound to the engine whose callbacks keep the session
    /// table in step with its lifecycle.
    fn open_transport(&self) -> Result<Arc<StreamableHttpTransport>, ServerError> {
        let connection = self.engine.connect()?;
        let registered_in: Weak<SessionTable> = Arc::downgrade(&self.sessions);
        let removed_from: Weak<SessionTable> = Arc::downgrade(&self.sessions);

        Ok(Arc::new_cyclic(|this: &Weak<StreamableHttpTransport>| {
            let this = this.clone();
            StreamableHttpTransport::new(connection)
                .on_session_initialized(move |sid| {
                    tracing::info!(session_id = %sid, "session initialized");
                    if let (Some(table), Some(transport)) = (registered_in.upgrade(), this.upgrade())
                    {
                        table.ensure_registered(sid, transport);
                    }
                })
                .on_close(move |sid| {
                    tracing::info!(session_id = %sid, "transport closed");
                    if let Some(table) = removed_from.upgrade() {
                        table.remove(sid);
                    }
                })
        }))
    }

    /// DELETE: explicit session termination.
    ///
    /// Not authenticated: knowing a live session id is enough to end it.
    pub async fn handle_delete(&self, request: IncomingRequest) -> Response {
        let Some(transport) = request.session_id().and_then(|sid| self.sessions.get(sid)) else {
            tracing::warn!(
                session_id = request.session_id().unwrap_or("(empty session)"),
                "invalid or missing session id on termination request"
            );
            return (StatusCode::BAD_REQUEST, "Invalid or missing session ID").into_response();
        };

        tracing::info!(
            session_id = request.session_id().unwrap_or_default(),
            "session termination requested"
        );

        match transport.handle_request(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "error handling session termination");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Error processing session termination",
                )
                    .into_response()
            }
        }
    }

    /// Close every open session, then the protocol engine.
    ///
    /// A failing session is logged and removed anyway; the remaining ones are
    /// still closed.
    pub async fn close(&self) {
        for (sid, transport) in self.sessions.snapshot() {
            if let Err(e) = transport.close().await {
                tracing::error!(session_id = %sid, error = %e, "error closing transport");
            }
            self.sessions.remove(&sid);
        }

        self.engine.close();
    }

    fn authorize(&self, request: &IncomingRequest) -> Result<(), ServerError> {
        if self
            .auth
            .authenticate(&request.headers, request.query_token.as_deref())
        {
            Ok(())
        } else {
            Err(ServerError::Unauthorized)
        }
    }

    /// axum router serving GET/POST/DELETE on `path`.
    pub fn router(self: Arc<Self>, path: &str) -> Router {
        Router::new()
            .route(path, get(http_get).post(http_post).delete(http_delete))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_request(DefaultOnRequest::new().level(Level::INFO))
                    .on_response(DefaultOnResponse::new().level(Level::INFO)),
            )
            .with_state(self)
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuthQuery {
    token: Option<String>,
}

async fn http_get(
    State(server): State<Arc<McpServer>>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    server
        .handle_get(IncomingRequest::new(Method::GET, headers, query.token, None))
        .await
}

async fn http_post(
    State(server): State<Arc<McpServer>>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request body");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(JsonRpcResponse::protocol_error(
                        "Parse error",
                        Some(JsonRpcError::PARSE_ERROR),
                    )),
                )
                    .into_response();
            }
        }
    };

    server
        .handle_post(IncomingRequest::new(Method::POST, headers, query.token, body))
        .await
}

async fn http_delete(
    State(server): State<Arc<McpServer>>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    server
        .handle_delete(IncomingRequest::new(Method::DELETE, headers, query.token, None))
        .await
}
