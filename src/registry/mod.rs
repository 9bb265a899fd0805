//! Capability registries.
//!
//! A [`Registry`] is a name-indexed catalogue of descriptors kept in
//! registration order. Registration takes an exclusive lock and lookups a
//! shared one, so descriptors can be added while sessions are running. Locks
//! are never held across an `.await`: lookups clone the descriptor's `Arc`
//! and release the lock before the handler runs.
//!
//! Registration rejects duplicate keys and schemas using `oneOf`, `anyOf` or
//! `allOf` anywhere, and compiles each tool's input schema once. Invocation
//! validates arguments against the compiled schema before the handler is
//! reached, so invalid input never costs a subprocess.

pub mod schema;

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use indexmap::IndexMap;
use jsonschema::Validator;
use serde_json::{json, Map, Value};

use crate::error::{McpError, RegistryError};
use crate::mcp::context::RequestContext;
use crate::mcp::types::{
    PromptArgument, PromptDefinition, PromptGetResult, ResourceDefinition, ResourceReadResult,
    ToolCallResult, ToolDefinition,
};

/// Executes a tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Checks constraints the input schema cannot express.
    ///
    /// Runs after schema validation and before [`call`](Self::call).
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint.
    fn check_arguments(&self, _arguments: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Runs the tool with validated arguments.
    ///
    /// # Errors
    ///
    /// Returns an [`McpError`] that is sent to the client.
    async fn call(&self, ctx: &RequestContext, arguments: Value)
        -> Result<ToolCallResult, McpError>;
}

/// Reads a resource.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Produces the contents of `uri`.
    ///
    /// # Errors
    ///
    /// Returns an [`McpError`] that is sent to the client.
    async fn read(&self, ctx: &RequestContext, uri: &str) -> Result<ResourceReadResult, McpError>;
}

/// Renders a prompt.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    /// Renders the prompt with validated arguments.
    ///
    /// # Errors
    ///
    /// Returns an [`McpError`] that is sent to the client.
    async fn get(
        &self,
        ctx: &RequestContext,
        arguments: &Map<String, Value>,
    ) -> Result<PromptGetResult, McpError>;
}

/// A registered tool.
pub struct ToolDescriptor {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the arguments.
    pub input_schema: Value,
    /// JSON Schema for `structuredContent`.
    pub output_schema: Option<Value>,
    /// The handler.
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    /// The `tools/list` entry for this tool.
    #[must_use]
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: Some(self.description.clone()),
            input_schema: self.input_schema.clone(),
            output_schema: self.output_schema.clone(),
        }
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A registered resource.
pub struct ResourceDescriptor {
    /// Unique resource URI.
    pub uri: String,
    /// Short name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// MIME type of the contents.
    pub mime_type: String,
    /// The handler.
    pub handler: Arc<dyn ResourceHandler>,
}

impl ResourceDescriptor {
    /// The `resources/list` entry for this resource.
    #[must_use]
    pub fn definition(&self) -> ResourceDefinition {
        ResourceDefinition {
            uri: self.uri.clone(),
            name: self.name.clone(),
            description: Some(self.description.clone()),
            mime_type: Some(self.mime_type.clone()),
        }
    }
}

impl fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

/// A registered prompt.
pub struct PromptDescriptor {
    /// Unique prompt name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Declared arguments.
    pub arguments: Vec<PromptArgument>,
    /// The handler.
    pub handler: Arc<dyn PromptHandler>,
}

impl PromptDescriptor {
    /// The `prompts/list` entry for this prompt.
    #[must_use]
    pub fn definition(&self) -> PromptDefinition {
        PromptDefinition {
            name: self.name.clone(),
            description: Some(self.description.clone()),
            arguments: self.arguments.clone(),
        }
    }
}

impl fmt::Debug for PromptDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptDescriptor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Common behaviour of registrable descriptors.
pub trait Descriptor: Send + Sync {
    /// Registry kind, used in errors and logs.
    const KIND: &'static str;

    /// Whatever registration derives from the descriptor and keeps with it.
    type Compiled: Send + Sync;

    /// The unique key.
    fn key(&self) -> &str;

    /// Checks the descriptor and prepares it for storage.
    ///
    /// # Errors
    ///
    /// Returns the registration failure.
    fn compile(&self) -> Result<Self::Compiled, RegistryError>;
}

fn check_schema(kind: &'static str, name: &str, schema: &Value) -> Result<(), RegistryError> {
    match schema::find_composition(schema) {
        Some(found) => Err(RegistryError::DisallowedComposition {
            kind,
            name: name.to_string(),
            keyword: found.keyword,
            path: found.pointer,
        }),
        None => Ok(()),
    }
}

impl Descriptor for ToolDescriptor {
    const KIND: &'static str = "tool";

    /// The compiled input schema.
    type Compiled = Validator;

    fn key(&self) -> &str {
        &self.name
    }

    fn compile(&self) -> Result<Validator, RegistryError> {
        let invalid = |message: String| RegistryError::InvalidDescriptor {
            kind: Self::KIND,
            name: self.name.clone(),
            message,
        };
        if self.input_schema.get("type").and_then(Value::as_str) != Some("object") {
            return Err(invalid("input schema must have type \"object\"".to_string()));
        }
        check_schema(Self::KIND, &self.name, &self.input_schema)?;
        if let Some(output) = &self.output_schema {
            check_schema(Self::KIND, &self.name, output)?;
        }
        schema::compile(&self.input_schema).map_err(|e| invalid(format!("input schema: {e}")))
    }
}

impl Descriptor for ResourceDescriptor {
    const KIND: &'static str = "resource";

    type Compiled = ();

    fn key(&self) -> &str {
        &self.uri
    }

    fn compile(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}

impl Descriptor for PromptDescriptor {
    const KIND: &'static str = "prompt";

    type Compiled = ();

    fn key(&self) -> &str {
        &self.name
    }

    fn compile(&self) -> Result<(), RegistryError> {
        for (i, argument) in self.arguments.iter().enumerate() {
            if self.arguments[..i].iter().any(|a| a.name == argument.name) {
                return Err(RegistryError::InvalidDescriptor {
                    kind: Self::KIND,
                    name: self.name.clone(),
                    message: format!("argument '{}' is declared twice", argument.name),
                });
            }
        }
        Ok(())
    }
}

/// A descriptor and what registration compiled from it.
struct Entry<D: Descriptor> {
    descriptor: Arc<D>,
    compiled: Arc<D::Compiled>,
}

impl<D: Descriptor> Clone for Entry<D> {
    fn clone(&self) -> Self {
        Self {
            descriptor: Arc::clone(&self.descriptor),
            compiled: Arc::clone(&self.compiled),
        }
    }
}

/// An ordered, name-indexed catalogue of descriptors.
pub struct Registry<D: Descriptor> {
    entries: RwLock<IndexMap<String, Entry<D>>>,
}

impl<D: Descriptor> Default for Registry<D> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
        }
    }
}

impl<D: Descriptor> fmt::Debug for Registry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Registry")
            .field("kind", &D::KIND)
            .field("keys", &entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<D: Descriptor> Registry<D> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is empty or already registered, or the
    /// descriptor fails its own checks. Nothing is stored on error.
    pub fn register(&self, descriptor: D) -> Result<(), RegistryError> {
        let key = descriptor.key().to_string();
        if key.is_empty() {
            return Err(RegistryError::InvalidDescriptor {
                kind: D::KIND,
                name: key,
                message: "key must not be empty".to_string(),
            });
        }
        let compiled = descriptor.compile()?;

        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&key) {
            return Err(RegistryError::Duplicate {
                kind: D::KIND,
                name: key,
            });
        }
        tracing::debug!(kind = D::KIND, key = %key, "Registered");
        entries.insert(
            key,
            Entry {
                descriptor: Arc::new(descriptor),
                compiled: Arc::new(compiled),
            },
        );
        Ok(())
    }

    fn entry(&self, key: &str) -> Option<Entry<D>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Looks up a descriptor.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<D>> {
        self.entry(key).map(|entry| entry.descriptor)
    }

    /// All descriptors in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<D>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| Arc::clone(&entry.descriptor))
            .collect()
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Registry<ToolDescriptor> {
    /// Validates arguments and runs a tool.
    ///
    /// Absent or `null` arguments are treated as `{}`.
    ///
    /// # Errors
    ///
    /// Returns `ToolNotFound` for an unknown tool, `InvalidParams` if the
    /// arguments fail the schema or the handler's check, or the handler's
    /// own error.
    pub async fn invoke(
        &self,
        name: &str,
        ctx: &RequestContext,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        let Entry {
            descriptor: tool,
            compiled: validator,
        } = self
            .entry(name)
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;

        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };

        let details = schema::violations(&validator, &arguments);
        if !details.is_empty() {
            return Err(McpError::InvalidParams {
                message: format!("arguments for '{name}' do not match the input schema"),
                details,
            });
        }
        tool.handler
            .check_arguments(&arguments)
            .map_err(McpError::invalid_params)?;

        tool.handler.call(ctx, arguments).await
    }

    /// The `tools/list` entries.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.list().iter().map(|t| t.definition()).collect()
    }
}

impl Registry<ResourceDescriptor> {
    /// Reads a resource.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` for an unknown URI, or the handler's error.
    pub async fn invoke(
        &self,
        uri: &str,
        ctx: &RequestContext,
    ) -> Result<ResourceReadResult, McpError> {
        let resource = self
            .get(uri)
            .ok_or_else(|| McpError::ResourceNotFound(uri.to_string()))?;
        resource.handler.read(ctx, uri).await
    }

    /// The `resources/list` entries.
    #[must_use]
    pub fn definitions(&self) -> Vec<ResourceDefinition> {
        self.list().iter().map(|r| r.definition()).collect()
    }
}

impl Registry<PromptDescriptor> {
    /// Validates arguments and renders a prompt.
    ///
    /// # Errors
    ///
    /// Returns `PromptNotFound` for an unknown prompt, `InvalidParams` for a
    /// missing required argument, an undeclared argument or a non-string
    /// value, or the handler's error.
    pub async fn invoke(
        &self,
        name: &str,
        ctx: &RequestContext,
        arguments: Option<Map<String, Value>>,
    ) -> Result<PromptGetResult, McpError> {
        let prompt = self
            .get(name)
            .ok_or_else(|| McpError::PromptNotFound(name.to_string()))?;
        let arguments = arguments.unwrap_or_default();

        let mut details = Vec::new();
        for declared in prompt.arguments.iter().filter(|a| a.required) {
            if !arguments.contains_key(&declared.name) {
                details.push(format!("missing required argument '{}'", declared.name));
            }
        }
        for (key, value) in &arguments {
            if !prompt.arguments.iter().any(|a| &a.name == key) {
                details.push(format!("unknown argument '{key}'"));
            } else if !value.is_string() {
                details.push(format!("argument '{key}' must be a string"));
            }
        }
        if !details.is_empty() {
            return Err(McpError::InvalidParams {
                message: format!("arguments for prompt '{name}' are invalid"),
                details,
            });
        }

        prompt.handler.get(ctx, &arguments).await
    }

    /// The `prompts/list` entries.
    #[must_use]
    pub fn definitions(&self) -> Vec<PromptDefinition> {
        self.list().iter().map(|p| p.definition()).collect()
    }
}

/// The three registries a server exposes.
#[derive(Debug, Default)]
pub struct Registries {
    /// Tools.
    pub tools: Registry<ToolDescriptor>,
    /// Resources.
    pub resources: Registry<ResourceDescriptor>,
    /// Prompts.
    pub prompts: Registry<PromptDescriptor>,
}

impl Registries {
    /// Creates empty registries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
