//! Tool adapter trait abstraction
//!
//! Every capture kind implements [`DiagnosticToolAdapter`] so the coordinator
//! can run any tool through the same contract.
//!
//! ## Error Handling
//!
//! - Problems the tool reports about its own capture (partial dump, non-zero
//!   exit) belong in [`ToolOutput::errors`]; they are recorded on the
//!   instance and collection still completes.
//! - Only failures to run the tool at all should return `Err`.

use crate::error::Result;
use crate::types::{DiagnosticTool, LogFile};
use async_trait::async_trait;
use std::path::Path;

/// What a capture produced.
#[derive(Debug, Default, Clone)]
pub struct ToolOutput {
    /// Artifacts written under the scratch directory
    pub logs: Vec<LogFile>,
    /// Non-fatal errors reported by the tool
    pub errors: Vec<String>,
}

/// Trait implemented by all capture tools.
///
/// ## Example
///
/// ```rust,ignore
/// use clusterdiag_core::tools::{DiagnosticToolAdapter, ToolOutput};
///
/// struct MyDumper;
///
/// #[async_trait]
/// impl DiagnosticToolAdapter for MyDumper {
///     fn tool(&self) -> DiagnosticTool { DiagnosticTool::MemoryDump }
///     // ... implement invoke
/// }
/// ```
#[async_trait]
pub trait DiagnosticToolAdapter: Send + Sync {
    /// Which tool this adapter implements
    fn tool(&self) -> DiagnosticTool;

    /// Run one capture.
    ///
    /// Artifacts must be written under `scratch_dir`; `instance_short_id`
    /// identifies the current instance to the tool.
    async fn invoke(
        &self,
        params: &str,
        scratch_dir: &Path,
        instance_short_id: &str,
    ) -> Result<ToolOutput>;
}
