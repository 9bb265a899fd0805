//! Prompt templates that walk a client through an analysis.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::McpError;
use crate::mcp::context::RequestContext;
use crate::mcp::types::{ContentBlock, PromptArgument, PromptGetResult, PromptMessage, Role};
use crate::registry::{PromptDescriptor, PromptHandler};

fn argument(name: &str, description: &str, required: bool) -> PromptArgument {
    PromptArgument {
        name: name.to_string(),
        description: Some(description.to_string()),
        required,
    }
}

fn text_arg<'a>(arguments: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn user(text: String) -> PromptMessage {
    PromptMessage {
        role: Role::User,
        content: ContentBlock::text(text),
    }
}

#[derive(Debug)]
struct AnalyzeDataset;

#[async_trait]
impl PromptHandler for AnalyzeDataset {
    async fn get(
        &self,
        _ctx: &RequestContext,
        arguments: &Map<String, Value>,
    ) -> Result<PromptGetResult, McpError> {
        let file_path = text_arg(arguments, "file_path")
            .ok_or_else(|| McpError::invalid_params("`file_path` must not be empty"))?;

        let mut text = format!(
            "Analyse the CSV dataset at `{file_path}`.\n\n\
             1. Call `descriptive_statistics` with `file_path` to see every numeric column, \
             its spread and its missing values.\n\
             2. Pick the analyses that fit the data: `correlation_analysis` for two related \
             measures, `t_test` to compare means, `linear_regression` to model one column from \
             others. Use `columns` to choose which columns each tool sees.\n\
             3. Report effect sizes alongside p-values and say which assumptions you could not \
             check."
        );
        if let Some(question) = text_arg(arguments, "question") {
            text.push_str("\n\nThe question to answer: ");
            text.push_str(question);
        }

        Ok(PromptGetResult {
            description: Some(format!("Exploratory analysis of {file_path}")),
            messages: vec![user(text)],
        })
    }
}

#[derive(Debug)]
struct InterpretResults;

#[async_trait]
impl PromptHandler for InterpretResults {
    async fn get(
        &self,
        _ctx: &RequestContext,
        arguments: &Map<String, Value>,
    ) -> Result<PromptGetResult, McpError> {
        let results = text_arg(arguments, "results")
            .ok_or_else(|| McpError::invalid_params("`results` must not be empty"))?;
        let audience = text_arg(arguments, "audience").unwrap_or("a non-specialist reader");

        let text = format!(
            "Interpret these statistical results for {audience}. Explain what was tested, \
             what the estimate means in plain language, whether it is statistically \
             significant, and what it does not show.\n\n{results}"
        );

        Ok(PromptGetResult {
            description: Some("Plain-language interpretation of a result".to_string()),
            messages: vec![user(text)],
        })
    }
}

/// Every default prompt, in registration order.
#[must_use]
pub fn descriptors() -> Vec<PromptDescriptor> {
    vec![
        PromptDescriptor {
            name: "analyze_dataset".to_string(),
            description: "Plan and run an exploratory analysis of a CSV dataset".to_string(),
            arguments: vec![
                argument("file_path", "CSV file under an allowed directory", true),
                argument("question", "What the analysis should answer", false),
            ],
            handler: Arc::new(AnalyzeDataset),
        },
        PromptDescriptor {
            name: "interpret_results".to_string(),
            description: "Explain a tool result in plain language".to_string(),
            arguments: vec![
                argument("results", "Text or JSON returned by a statistics tool", true),
                argument("audience", "Who the explanation is for", false),
            ],
            handler: Arc::new(InterpretResults),
        },
    ]
}
