//! The default statistical catalogue.
//!
//! Four tools backed by R scripts, resources exposing the server
//! configuration and each script's source, and two prompts. The scripts are
//! embedded in the binary and materialised by the lifespan at startup; every
//! script sources `common.R` from the library directory for request parsing
//! and JSON output (via the `jsonlite` R package).

pub mod dataset;
pub mod prompts;
pub mod resources;
pub mod tools;

use crate::bridge::ScriptSource;
use crate::error::RegistryError;
use crate::registry::Registries;

pub use tools::{Analysis, StatTool};

/// Shared helpers sourced by every script.
const COMMON_R: &str = include_str!("../../scripts/common.R");
const CORRELATION_R: &str = include_str!("../../scripts/correlation_analysis.R");
const DESCRIPTIVE_R: &str = include_str!("../../scripts/descriptive_statistics.R");
const REGRESSION_R: &str = include_str!("../../scripts/linear_regression.R");
const T_TEST_R: &str = include_str!("../../scripts/t_test.R");

/// The embedded script library.
#[must_use]
pub fn script_sources() -> Vec<ScriptSource> {
    vec![
        ScriptSource::r("common", COMMON_R),
        ScriptSource::r(Analysis::Correlation.name(), CORRELATION_R),
        ScriptSource::r(Analysis::Descriptive.name(), DESCRIPTIVE_R),
        ScriptSource::r(Analysis::Regression.name(), REGRESSION_R),
        ScriptSource::r(Analysis::TTest.name(), T_TEST_R),
    ]
}

/// Registers the default tools, resources and prompts into `registries`.
///
/// # Errors
///
/// Returns the first registration failure.
pub fn register_defaults(registries: &Registries) -> Result<(), RegistryError> {
    for analysis in Analysis::ALL {
        registries.tools.register(analysis.descriptor())?;
    }
    for resource in resources::descriptors() {
        registries.resources.register(resource)?;
    }
    for prompt in prompts::descriptors() {
        registries.prompts.register(prompt)?;
    }
    Ok(())
}

/// Fresh registries holding the default catalogue.
///
/// # Errors
///
/// Returns the first registration failure.
pub fn default_registries() -> Result<Registries, RegistryError> {
    let registries = Registries::new();
    register_defaults(&registries)?;
    Ok(registries)
}
