//! MCP server front door for agent integration.
//!
//! Exposes coverage queries as MCP tools over stdio JSON-RPC, so coding
//! agents can ask "how covered is this file" and "is this coverage still
//! trustworthy" without shelling out to the CLI.
//!
//! Start the server with:
//! ```bash
//! covscope mcp
//! ```
//!
//! The server owns one [`CoverageDataCache`] for its lifetime: repeated
//! tool calls against the same resultset are served from cache and
//! revalidated by signature + digest on every call, which is the access
//! pattern the cache exists for.

#![cfg(feature = "mcp")]

use std::path::PathBuf;
use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::cache::CoverageDataCache;
use crate::error::CovError;
use crate::model::{CoverageModel, ModelOptions, SortOrder};
use crate::staleness::StalenessMode;

// ============================================================================
// Tool Parameters
// ============================================================================

/// Parameters shared by project-scoped tools.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ProjectParams {
    /// Project root directory (optional, defaults to current directory).
    #[schemars(description = "Project root directory (optional, defaults to current directory)")]
    #[serde(default)]
    pub root: Option<String>,

    /// Resultset file or directory (optional, defaults to conventional locations).
    #[schemars(description = "Resultset file or directory (optional)")]
    #[serde(default)]
    pub resultset: Option<String>,

    /// Staleness enforcement: "off" or "error".
    #[schemars(description = "Staleness enforcement: off or error")]
    #[serde(default)]
    pub stale: Option<String>,

    /// Glob patterns scoping which files are expected to have coverage.
    #[schemars(description = "Glob patterns scoping which files are expected to have coverage")]
    #[serde(default)]
    pub tracked_globs: Option<Vec<String>>,
}

/// Parameters for per-file tools.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct FileParams {
    /// Source file path, relative to the root or absolute.
    #[schemars(description = "Source file path, relative to the root or absolute")]
    pub path: String,

    #[serde(flatten)]
    pub project: ProjectParams,
}

/// Parameters for the listing tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListParams {
    /// Listing order: "ascending" or "descending" (by percentage).
    #[schemars(description = "Listing order: ascending or descending (by percentage)")]
    #[serde(default)]
    pub sort_order: Option<String>,

    #[serde(flatten)]
    pub project: ProjectParams,
}

// ============================================================================
// MCP Server
// ============================================================================

/// MCP server for coverage queries.
#[derive(Clone)]
pub struct CovscopeServer {
    tool_router: ToolRouter<Self>,
    /// Shared across tool calls so repeated queries hit the coverage cache.
    cache: Arc<CoverageDataCache>,
}

impl Default for CovscopeServer {
    fn default() -> Self {
        Self::new()
    }
}

#[tool_router]
impl CovscopeServer {
    pub fn new() -> Self {
        CovscopeServer {
            tool_router: Self::tool_router(),
            cache: Arc::new(CoverageDataCache::new()),
        }
    }

    /// Build a model for one tool call from its project parameters.
    fn model_for(&self, params: &ProjectParams) -> Result<CoverageModel, McpError> {
        let staleness_mode = match params.stale.as_deref() {
            None => StalenessMode::Off,
            Some(s) => s.parse::<StalenessMode>().map_err(to_mcp_error)?,
        };
        let options = ModelOptions {
            root: params.root.as_ref().map(PathBuf::from),
            resultset: params.resultset.as_ref().map(PathBuf::from),
            staleness_mode,
            tracked_globs: params.tracked_globs.clone().unwrap_or_default(),
        };
        CoverageModel::new(&self.cache, &options).map_err(to_mcp_error)
    }

    #[tool(description = "Covered/total/percentage for one source file")]
    fn coverage_summary(
        &self,
        Parameters(params): Parameters<FileParams>,
    ) -> Result<CallToolResult, McpError> {
        let model = self.model_for(&params.project)?;
        let payload = model.summary_for(&params.path).map_err(to_mcp_error)?;
        json_result(model.relativize(&payload).map_err(to_mcp_error)?)
    }

    #[tool(description = "Raw per-line hit counts for one source file")]
    fn coverage_raw(
        &self,
        Parameters(params): Parameters<FileParams>,
    ) -> Result<CallToolResult, McpError> {
        let model = self.model_for(&params.project)?;
        let payload = model.raw_for(&params.path).map_err(to_mcp_error)?;
        json_result(model.relativize(&payload).map_err(to_mcp_error)?)
    }

    #[tool(description = "Uncovered line numbers for one source file")]
    fn uncovered_lines(
        &self,
        Parameters(params): Parameters<FileParams>,
    ) -> Result<CallToolResult, McpError> {
        let model = self.model_for(&params.project)?;
        let payload = model.uncovered_for(&params.path).map_err(to_mcp_error)?;
        json_result(model.relativize(&payload).map_err(to_mcp_error)?)
    }

    #[tool(description = "Detailed per-line coverage rows for one source file")]
    fn coverage_detailed(
        &self,
        Parameters(params): Parameters<FileParams>,
    ) -> Result<CallToolResult, McpError> {
        let model = self.model_for(&params.project)?;
        let payload = model.detailed_for(&params.path).map_err(to_mcp_error)?;
        json_result(model.relativize(&payload).map_err(to_mcp_error)?)
    }

    #[tool(description = "Staleness verdict for one source file's coverage")]
    fn file_staleness(
        &self,
        Parameters(params): Parameters<FileParams>,
    ) -> Result<CallToolResult, McpError> {
        let model = self.model_for(&params.project)?;
        let payload = model.staleness_for(&params.path);
        json_result(model.relativize(&payload).map_err(to_mcp_error)?)
    }

    #[tool(description = "Per-file coverage listing for the whole project")]
    fn all_files_coverage(
        &self,
        Parameters(params): Parameters<ListParams>,
    ) -> Result<CallToolResult, McpError> {
        let model = self.model_for(&params.project)?;
        let sort_order = match params.sort_order.as_deref() {
            None => SortOrder::default(),
            Some(s) => s.parse::<SortOrder>().map_err(to_mcp_error)?,
        };
        let payload = model.list(sort_order).map_err(to_mcp_error)?;
        json_result(model.relativize(&payload).map_err(to_mcp_error)?)
    }

    #[tool(description = "Project-wide coverage totals across trustworthy files")]
    fn coverage_totals(
        &self,
        Parameters(params): Parameters<ProjectParams>,
    ) -> Result<CallToolResult, McpError> {
        let model = self.model_for(&params)?;
        let payload = model.project_totals().map_err(to_mcp_error)?;
        json_result(model.relativize(&payload).map_err(to_mcp_error)?)
    }

    #[tool(description = "Covscope version information")]
    fn version(&self) -> Result<CallToolResult, McpError> {
        json_result(serde_json::json!({
            "name": "covscope",
            "version": env!("CARGO_PKG_VERSION"),
        }))
    }
}

// ============================================================================
// Error Bridging
// ============================================================================

/// Convert a domain error into an MCP error, preserving the user-facing
/// message and the error class for agents.
fn to_mcp_error(err: CovError) -> McpError {
    let detail = serde_json::json!({ "message": err.user_message() });
    match err {
        CovError::Usage(_) | CovError::Config(_) => {
            McpError::invalid_params(err.to_string(), Some(detail))
        }
        _ => McpError::internal_error(err.to_string(), Some(detail)),
    }
}

fn json_result(value: Value) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(&value).map_err(|e| {
        McpError::internal_error(
            "Failed to serialize response",
            Some(serde_json::json!({ "error": e.to_string() })),
        )
    })?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

// ============================================================================
// ServerHandler Implementation
// ============================================================================

#[tool_handler]
impl ServerHandler for CovscopeServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "covscope".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Covscope serves test-run line coverage. Use the tools to look up \
                 per-file coverage, uncovered lines, project totals, and whether \
                 the coverage data is still trustworthy for the current sources."
                    .to_string(),
            ),
        }
    }
}

// ============================================================================
// Entry Point
// ============================================================================

/// Run the MCP server on stdio until the client disconnects.
pub async fn run_mcp_server() -> Result<(), CovError> {
    let server = CovscopeServer::new();
    let service = server
        .serve(stdio())
        .await
        .map_err(|e| CovError::Internal(format!("MCP server failed to start: {e}")))?;

    service
        .waiting()
        .await
        .map_err(|e| CovError::Internal(format!("MCP server error: {e}")))?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_creates_successfully() {
        let server = CovscopeServer::new();
        let info = server.get_info();
        assert_eq!(info.server_info.name, "covscope");
        assert_eq!(info.server_info.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn domain_errors_bridge_by_class() {
        let usage = to_mcp_error(CovError::Usage("bad flag".into()));
        assert!(usage.message.contains("bad flag"));

        let not_found = to_mcp_error(CovError::FileNotFound { path: "x".into() });
        assert!(not_found.message.contains("file not found"));
    }
}
