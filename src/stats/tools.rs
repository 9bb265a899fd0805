//! Statistical tools.
//!
//! Every tool follows the same path: load the dataset (inline `data` or a CSV
//! `file_path` under an allowed root), select and check its columns, hand
//! `{data, options}` to the tool's R script and format the payload it prints.
//! Shape violations are reported as invalid params before anything is
//! spawned.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::bridge::ExecutionRequest;
use crate::error::McpError;
use crate::format::format_success;
use crate::mcp::context::RequestContext;
use crate::mcp::types::ToolCallResult;
use crate::registry::{ToolDescriptor, ToolHandler};
use crate::stats::dataset::{Dataset, Shape};

use std::sync::Arc;

/// The analyses exposed as tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Analysis {
    /// Pearson, Spearman or Kendall correlation of two columns.
    Correlation,
    /// Per-column summary statistics.
    Descriptive,
    /// Ordinary least squares with one response and one or more predictors.
    Regression,
    /// One-sample, two-sample or paired t-test.
    TTest,
}

impl Analysis {
    /// Every analysis, in registration order.
    pub const ALL: [Self; 4] = [
        Self::Correlation,
        Self::Descriptive,
        Self::Regression,
        Self::TTest,
    ];

    /// Tool name, also the name of its script.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Correlation => "correlation_analysis",
            Self::Descriptive => "descriptive_statistics",
            Self::Regression => "linear_regression",
            Self::TTest => "t_test",
        }
    }

    const fn description(self) -> &'static str {
        match self {
            Self::Correlation => {
                "Correlation between two numeric columns (Pearson, Spearman or Kendall) \
                 with a significance test and confidence interval."
            }
            Self::Descriptive => {
                "Summary statistics for each numeric column: count, missing values, mean, \
                 standard deviation, quartiles, minimum and maximum."
            }
            Self::Regression => {
                "Ordinary least squares regression of a response column on the other \
                 selected columns, with coefficient tests and R squared."
            }
            Self::TTest => {
                "Student or Welch t-test: one column against `mu`, or two columns \
                 (independent or paired)."
            }
        }
    }

    /// Column constraints for a call with `arguments`.
    #[must_use]
    pub fn shape(self, arguments: &Value) -> Shape {
        match self {
            Self::Correlation => Shape {
                min_columns: 2,
                max_columns: Some(2),
                paired: true,
            },
            Self::Descriptive => Shape {
                min_columns: 1,
                max_columns: None,
                paired: false,
            },
            Self::Regression => Shape {
                min_columns: 2,
                max_columns: None,
                paired: true,
            },
            Self::TTest => Shape {
                min_columns: 1,
                max_columns: Some(2),
                paired: arguments
                    .get("paired")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
        }
    }

    /// Tool-specific option names copied into the script's `options`.
    const fn option_keys(self) -> &'static [&'static str] {
        match self {
            Self::Correlation => &["method", "conf_level"],
            Self::Descriptive => &[],
            Self::Regression => &["response"],
            Self::TTest => &["mu", "paired", "var_equal", "alternative", "conf_level"],
        }
    }

    fn option_properties(self) -> Map<String, Value> {
        let conf_level = json!({
            "type": "number",
            "minimum": 0.5,
            "maximum": 0.999,
            "default": 0.95,
            "description": "Confidence level of the interval"
        });
        let properties = match self {
            Self::Correlation => json!({
                "method": {
                    "type": "string",
                    "enum": ["pearson", "spearman", "kendall"],
                    "default": "pearson"
                },
                "conf_level": conf_level
            }),
            Self::Descriptive => json!({}),
            Self::Regression => json!({
                "response": {
                    "type": "string",
                    "description": "Response column; defaults to the first selected column"
                }
            }),
            Self::TTest => json!({
                "mu": {"type": "number", "default": 0, "description": "Hypothesised mean or mean difference"},
                "paired": {"type": "boolean", "default": false},
                "var_equal": {"type": "boolean", "default": false, "description": "Pool variances (Student) instead of Welch"},
                "alternative": {
                    "type": "string",
                    "enum": ["two.sided", "less", "greater"],
                    "default": "two.sided"
                },
                "conf_level": conf_level
            }),
        };
        match properties {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// JSON Schema for the tool's arguments.
    #[must_use]
    pub fn input_schema(self) -> Value {
        let mut properties = Map::new();
        properties.insert(
            "data".to_string(),
            json!({
                "type": "object",
                "description": "Named numeric columns; null marks a missing value",
                "additionalProperties": {
                    "type": "array",
                    "items": {"type": ["number", "null"]}
                }
            }),
        );
        properties.insert(
            "file_path".to_string(),
            json!({
                "type": "string",
                "minLength": 1,
                "description": "CSV file with a header row, under an allowed directory"
            }),
        );
        properties.insert(
            "columns".to_string(),
            json!({
                "type": "array",
                "items": {"type": "string", "minLength": 1},
                "minItems": 1,
                "description": "Columns to analyse, in order; defaults to every numeric column"
            }),
        );
        properties.extend(self.option_properties());

        json!({
            "type": "object",
            "properties": properties,
            "additionalProperties": false
        })
    }

    fn output_schema(self) -> Option<Value> {
        match self {
            Self::Correlation => Some(json!({
                "type": "object",
                "required": ["method", "estimate", "p_value", "n"],
                "properties": {
                    "method": {"type": "string"},
                    "estimate": {"type": ["number", "null"]},
                    "p_value": {"type": ["number", "null"]},
                    "n": {"type": "integer"}
                }
            })),
            Self::Descriptive => Some(json!({
                "type": "object",
                "required": ["columns"],
                "properties": {"columns": {"type": "array", "items": {"type": "object"}}}
            })),
            Self::Regression | Self::TTest => None,
        }
    }

    /// The tool descriptor, bound to a [`StatTool`] handler.
    #[must_use]
    pub fn descriptor(self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            output_schema: self.output_schema(),
            handler: Arc::new(StatTool { analysis: self }),
        }
    }
}

/// Runs one [`Analysis`] through the execution bridge.
#[derive(Debug, Clone, Copy)]
pub struct StatTool {
    analysis: Analysis,
}

impl StatTool {
    /// Creates the handler for `analysis`.
    #[must_use]
    pub const fn new(analysis: Analysis) -> Self {
        Self { analysis }
    }

    /// Selects the requested columns and checks the analysis constraints.
    fn prepare(self, dataset: Dataset, arguments: &Value) -> Result<Dataset, String> {
        let columns = requested_columns(arguments)?;
        let mut dataset = dataset.select(columns.as_deref())?;

        if self.analysis == Analysis::Regression {
            if let Some(response) = arguments.get("response").and_then(Value::as_str) {
                dataset.move_to_front(response)?;
            }
        }

        dataset
            .check_shape(self.analysis.shape(arguments))
            .map_err(|e| format!("{} {e}", self.analysis.name()))?;
        Ok(dataset)
    }

    async fn load(self, ctx: &RequestContext, arguments: &Value) -> Result<Dataset, McpError> {
        let dataset = match (arguments.get("data"), arguments.get("file_path")) {
            (Some(data), None) => Dataset::from_inline(data),
            (None, Some(Value::String(file_path))) => {
                let path = ctx
                    .lifespan()
                    .resolve_path(file_path)
                    .map_err(McpError::invalid_params)?;
                tracing::debug!(path = %path.display(), "Loading dataset");
                Dataset::from_csv_file(&path).await
            }
            _ => Err(source_error()),
        }
        .map_err(McpError::invalid_params)?;

        self.prepare(dataset, arguments)
            .map_err(McpError::invalid_params)
    }

    fn options(self, arguments: &Value, dataset: &Dataset) -> Value {
        let mut options = Map::new();
        for key in self.analysis.option_keys() {
            if let Some(value) = arguments.get(*key) {
                options.insert((*key).to_string(), value.clone());
            }
        }
        if self.analysis == Analysis::Regression && !options.contains_key("response") {
            if let Some(first) = dataset.names().next() {
                options.insert("response".to_string(), json!(first));
            }
        }
        Value::Object(options)
    }
}

fn source_error() -> String {
    "provide exactly one of `data` or `file_path`".to_string()
}

fn requested_columns(arguments: &Value) -> Result<Option<Vec<String>>, String> {
    match arguments.get("columns") {
        None | Some(Value::Null) => Ok(None),
        Some(columns) => serde_json::from_value(columns.clone())
            .map(Some)
            .map_err(|_| "`columns` must be an array of column names".to_string()),
    }
}

#[async_trait]
impl ToolHandler for StatTool {
    fn check_arguments(&self, arguments: &Value) -> Result<(), String> {
        match (arguments.get("data"), arguments.get("file_path")) {
            // File datasets are checked once loaded, still before any spawn.
            (None, Some(_)) => Ok(()),
            (Some(data), None) => {
                let dataset = Dataset::from_inline(data)?;
                self.prepare(dataset, arguments).map(|_| ())
            }
            _ => Err(source_error()),
        }
    }

    async fn call(
        &self,
        ctx: &RequestContext,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        let tool = self.analysis.name();
        let dataset = self.load(ctx, &arguments).await?;

        let request = ExecutionRequest {
            tool: tool.to_string(),
            script: tool.to_string(),
            arguments: json!({
                "data": dataset.to_json(),
                "options": self.options(&arguments, &dataset),
            }),
        };

        tracing::info!(
            tool,
            request = %ctx.request_id(),
            columns = dataset.len(),
            "Running analysis"
        );
        ctx.report_progress(0.0, Some(2.0), "Starting R");

        let outcome = ctx
            .lifespan()
            .bridge()
            .execute(&request, ctx.cancel_signal())
            .await;
        let output = outcome.into_result(tool)?;

        ctx.report_progress(2.0, Some(2.0), "Analysis complete");
        Ok(format_success(tool, &output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::schema;

    #[test]
    fn schemas_are_plain_objects() {
        for analysis in Analysis::ALL {
            let schema = analysis.input_schema();
            assert_eq!(schema["type"], "object");
            assert!(schema::find_composition(&schema).is_none());
            assert!(schema["properties"]["data"].is_object());
        }
    }

    #[test]
    fn scenario_mismatched_lengths_fail_the_check() {
        let tool = StatTool::new(Analysis::Correlation);
        let err = tool
            .check_arguments(&json!({"data": {"x": [1, 2], "y": [1, 2, 3]}}))
            .unwrap_err();
        assert!(err.starts_with("correlation_analysis paired columns"));
    }

    #[test]
    fn data_and_file_path_are_exclusive() {
        let tool = StatTool::new(Analysis::Descriptive);
        assert!(tool
            .check_arguments(&json!({"data": {"x": [1]}, "file_path": "a.csv"}))
            .is_err());
        assert!(tool.check_arguments(&json!({})).is_err());
        assert!(tool.check_arguments(&json!({"file_path": "a.csv"})).is_ok());
    }

    #[test]
    fn t_test_pairs_only_when_asked() {
        let tool = StatTool::new(Analysis::TTest);
        let data = json!({"a": [1, 2, 3], "b": [2, 3]});
        assert!(tool.check_arguments(&json!({"data": data.clone()})).is_ok());
        assert!(tool
            .check_arguments(&json!({"data": data, "paired": true}))
            .is_err());
    }

    #[test]
    fn columns_select_before_checking() {
        let tool = StatTool::new(Analysis::Correlation);
        let args = json!({
            "data": {"x": [1, 2, 3], "y": [2, 4, 6], "z": [1]},
            "columns": ["x", "y"]
        });
        assert!(tool.check_arguments(&args).is_ok());

        let all = json!({"data": {"x": [1, 2, 3], "y": [2, 4, 6], "z": [1]}});
        assert!(tool.check_arguments(&all).unwrap_err().contains("at most 2"));
    }

    #[test]
    fn regression_response_goes_first() {
        let tool = StatTool::new(Analysis::Regression);
        let args = json!({"data": {"x": [1, 2, 3], "y": [2, 4, 7]}, "response": "y"});
        let dataset = tool
            .prepare(Dataset::from_inline(&args["data"]).unwrap(), &args)
            .unwrap();
        assert_eq!(dataset.names().collect::<Vec<_>>(), vec!["y", "x"]);
        assert_eq!(tool.options(&args, &dataset), json!({"response": "y"}));

        let unknown = json!({"data": {"x": [1], "y": [2]}, "response": "w"});
        assert!(tool.check_arguments(&unknown).is_err());
    }

    #[test]
    fn options_default_regression_response() {
        let tool = StatTool::new(Analysis::Regression);
        let args = json!({"data": {"a": [1, 2, 3], "b": [3, 2, 1]}});
        let dataset = Dataset::from_inline(&args["data"]).unwrap();
        assert_eq!(tool.options(&args, &dataset), json!({"response": "a"}));
    }
}
