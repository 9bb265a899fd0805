//! rstats-mcp: MCP server exposing R statistical analyses to AI assistants
//!
//! The server speaks the Model Context Protocol over stdio or HTTP and runs
//! each statistical tool as an R script in a fresh subprocess.
//!
//! # Architecture
//!
//! The server owns the protocol and the process plumbing. R owns the
//! statistics:
//!
//! - **Protocol**: session lifecycle, dispatch, cancellation and draining
//! - **Registries**: tools, resources and prompts with schema-checked inputs
//! - **Execution bridge**: one `Rscript` per call, with a timeout, capped
//!   output, classified failures and guaranteed reaping
//! - **Formatting**: Markdown tables and structured JSON for the client
//!
//! # Modules
//!
//! - [`bridge`]: External runtime execution and result cache
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types
//! - [`format`]: Result formatting
//! - [`lifespan`]: Process-wide resources
//! - [`mcp`]: MCP protocol implementation
//! - [`registry`]: Capability registries and schema checks
//! - [`stats`]: The default statistical tools, resources and prompts

pub mod bridge;
pub mod config;
pub mod error;
pub mod format;
pub mod lifespan;
pub mod mcp;
pub mod registry;
pub mod stats;
