//! In-memory tool registry.
//!
//! Populated once before the server accepts traffic, then only read by the
//! protocol engine when answering `tools/list` and `tools/call`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::protocol::ToolResult;
use crate::schema::{InputSchema, SchemaError};

/// Default timeout for a single tool invocation (30 seconds).
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Invoke operation of a tool. Receives arguments already validated against
/// the tool's input schema.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<ToolResult, ToolError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolResult, ToolError>> + Send,
{
    async fn call(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        (self.0)(arguments).await
    }
}

/// Wrap an async closure as a [`ToolHandler`].
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolResult, ToolError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool \"{0}\" not found")]
    NotFound(String),
    #[error("Invalid arguments for tool \"{tool}\": {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("{0}")]
    Invocation(String),
    #[error("tool \"{tool}\" timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },
}

/// Registration failures. These are programming errors surfaced at startup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("argument tool.{0} is required")]
    MissingField(&'static str),
    #[error("invalid input schema for tool \"{tool}\": {source}")]
    InvalidSchema {
        tool: String,
        #[source]
        source: SchemaError,
    },
}

/// Registered metadata and invocation entry point for one tool.
#[derive(Clone)]
pub struct ToolDescriptor {
    name: String,
    description: String,
    input_schema: InputSchema,
    handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn builder() -> ToolDescriptorBuilder {
        ToolDescriptorBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &InputSchema {
        &self.input_schema
    }

    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.as_value().clone(),
        }
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ToolDescriptorBuilder {
    name: Option<String>,
    description: Option<String>,
    input_schema: Option<Value>,
    handler: Option<Arc<dyn ToolHandler>>,
}

impl ToolDescriptorBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Validate and assemble the descriptor.
    ///
    /// Empty strings and a `null` schema count as missing.
    pub fn build(self) -> Result<ToolDescriptor, RegistryError> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or(RegistryError::MissingField("name"))?;
        let description = self
            .description
            .filter(|d| !d.trim().is_empty())
            .ok_or(RegistryError::MissingField("description"))?;
        let schema = self
            .input_schema
            .filter(|s| !s.is_null())
            .ok_or(RegistryError::MissingField("inputSchema"))?;
        let handler = self.handler.ok_or(RegistryError::MissingField("toolCall"))?;

        let input_schema = InputSchema::new(schema).map_err(|source| {
            RegistryError::InvalidSchema {
                tool: name.clone(),
                source,
            }
        })?;

        Ok(ToolDescriptor {
            name,
            description,
            input_schema,
            handler,
        })
    }
}

/// Client-facing view of a tool, as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<ToolDescriptor>>>,
    timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

impl ToolRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a tool. A tool already registered under the same name is
    /// replaced (last registration wins).
    pub fn add_tool(&self, descriptor: ToolDescriptor) {
        let name = descriptor.name.clone();
        let previous = self
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::new(descriptor));

        if previous.is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous descriptor replaced");
        } else {
            tracing::debug!(tool = %name, "tool registered");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every registered tool, sorted by name.
    pub fn list(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|t| t.info())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Validate `arguments` and invoke the named tool.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<ToolResult, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        tool.input_schema
            .validate(&arguments)
            .map_err(|e| ToolError::InvalidArguments {
                tool: name.to_string(),
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(self.timeout, tool.handler.call(arguments)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool: name.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}
