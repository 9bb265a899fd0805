//! Read-only resources: the server configuration and the R script sources.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::McpError;
use crate::mcp::context::RequestContext;
use crate::mcp::types::{ResourceContents, ResourceReadResult};
use crate::registry::{ResourceDescriptor, ResourceHandler};
use crate::stats::tools::Analysis;

/// URI of the configuration summary.
pub const CONFIG_URI: &str = "stats://server/config";

/// URI prefix of the script sources.
pub const SCRIPT_URI_PREFIX: &str = "stats://scripts/";

/// Serves [`LifespanState::summary`](crate::lifespan::LifespanState::summary).
#[derive(Debug)]
struct ConfigResource;

#[async_trait]
impl ResourceHandler for ConfigResource {
    async fn read(&self, ctx: &RequestContext, uri: &str) -> Result<ResourceReadResult, McpError> {
        let text = serde_json::to_string_pretty(&ctx.lifespan().summary())
            .map_err(|e| McpError::Internal(format!("failed to serialise summary: {e}")))?;
        Ok(single(uri, "application/json", text))
    }
}

/// Serves the materialised source of one script.
#[derive(Debug)]
struct ScriptResource {
    script: &'static str,
}

#[async_trait]
impl ResourceHandler for ScriptResource {
    async fn read(&self, ctx: &RequestContext, uri: &str) -> Result<ResourceReadResult, McpError> {
        let script = ctx
            .lifespan()
            .bridge()
            .scripts()
            .get(self.script)
            .ok_or_else(|| McpError::ResourceNotFound(uri.to_string()))?;
        let text = tokio::fs::read_to_string(&script.path).await.map_err(|e| {
            McpError::Internal(format!("cannot read script '{}': {e}", self.script))
        })?;
        Ok(single(uri, "text/x-r", text))
    }
}

fn single(uri: &str, mime_type: &str, text: String) -> ResourceReadResult {
    ResourceReadResult {
        contents: vec![ResourceContents {
            uri: uri.to_string(),
            mime_type: Some(mime_type.to_string()),
            text,
        }],
    }
}

/// Every default resource, in registration order.
#[must_use]
pub fn descriptors() -> Vec<ResourceDescriptor> {
    let mut descriptors = vec![ResourceDescriptor {
        uri: CONFIG_URI.to_string(),
        name: "server-config".to_string(),
        description: "Allowed directories, cache, runtime settings and process counters"
            .to_string(),
        mime_type: "application/json".to_string(),
        handler: Arc::new(ConfigResource),
    }];

    descriptors.extend(Analysis::ALL.into_iter().map(|analysis| {
        let name = analysis.name();
        ResourceDescriptor {
            uri: format!("{SCRIPT_URI_PREFIX}{name}"),
            name: format!("{name}-script"),
            description: format!("R source run by the {name} tool"),
            mime_type: "text/x-r".to_string(),
            handler: Arc::new(ScriptResource { script: name }),
        }
    }));
    descriptors
}
