//! Core domain types for clusterdiag
//!
//! These types are persisted verbatim as JSON session records on the shared
//! file system, one file per [`Session`].
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | One cluster-wide capture request spanning every expected instance |
//! | **Instance** | One running process/node of the scaled-out target service |
//! | **ActiveInstance** | An instance's progress record inside a session |
//! | **LogFile** | One artifact produced by a capture on one instance |
//! | **Tool** | The kind of capture (memory dump, profiler trace) |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

// ============================================
// Tools
// ============================================

/// Kind of diagnostics capture a session requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticTool {
    /// Full process memory snapshot
    MemoryDump,
    /// Execution trace / profiler capture
    Profiler,
}

impl DiagnosticTool {
    /// All known tools.
    pub const ALL: [DiagnosticTool; 2] = [DiagnosticTool::MemoryDump, DiagnosticTool::Profiler];

    /// Returns the display name for this tool
    pub fn display_name(&self) -> &'static str {
        match self {
            DiagnosticTool::MemoryDump => "Memory Dump",
            DiagnosticTool::Profiler => "Profiler",
        }
    }

    /// Returns the identifier used in session records and config
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticTool::MemoryDump => "memory_dump",
            DiagnosticTool::Profiler => "profiler",
        }
    }
}

impl std::fmt::Display for DiagnosticTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DiagnosticTool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory_dump" | "memory-dump" | "MemoryDump" => Ok(DiagnosticTool::MemoryDump),
            "profiler" | "Profiler" => Ok(DiagnosticTool::Profiler),
            _ => Err(format!("unknown diagnostic tool: {}", s)),
        }
    }
}

// ============================================
// Status enums
// ============================================

/// Lifecycle status of a whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Submitted and waiting for instances to collect
    Active,
    /// At least one instance has started collecting
    Started,
    /// Every expected instance reported completion
    Complete,
    /// Completed by administrative override
    TimedOut,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Started => "started",
            SessionStatus::Complete => "complete",
            SessionStatus::TimedOut => "timed_out",
        }
    }

    /// Whether the session has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::TimedOut)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress of one instance within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    NotStarted,
    Started,
    Complete,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::NotStarted => "not_started",
            InstanceStatus::Started => "started",
            InstanceStatus::Complete => "complete",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================
// Artifacts
// ============================================

/// One artifact produced by a capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    /// Producer-local scratch path
    pub full_path: PathBuf,
    /// Display name (file name of the artifact)
    #[serde(default)]
    pub name: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
    /// Externally reachable path, set once archived
    #[serde(default)]
    pub relative_path: Option<String>,
}

impl LogFile {
    /// Describe an artifact by its scratch path; size and name are stamped at archival.
    pub fn new(full_path: impl Into<PathBuf>) -> Self {
        Self {
            full_path: full_path.into(),
            name: String::new(),
            size: 0,
            relative_path: None,
        }
    }

    /// File name component of the scratch path.
    pub fn file_name(&self) -> Option<&str> {
        self.full_path.file_name().and_then(|n| n.to_str())
    }
}

// ============================================
// Instances
// ============================================

/// Instance ids compare case-insensitively everywhere: membership, record
/// lookup and the completion set all go through this folding.
pub fn fold_instance_name(name: &str) -> String {
    name.to_lowercase()
}

fn same_instance(a: &str, b: &str) -> bool {
    fold_instance_name(a) == fold_instance_name(b)
}

/// Per-instance progress record inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveInstance {
    /// Instance identifier
    pub name: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub logs: Vec<LogFile>,
    /// Errors reported by the tool adapter on this instance
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ActiveInstance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: InstanceStatus::NotStarted,
            logs: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn is_named(&self, name: &str) -> bool {
        same_instance(&self.name, name)
    }
}

// ============================================
// Session
// ============================================

/// One cluster-wide diagnostics session.
///
/// `instances` is the completion target and is never changed after
/// submission; `active_instances` only grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Sortable, timestamp-derived identifier (empty until submitted)
    #[serde(default)]
    pub session_id: String,
    /// Capture kind; `None` until the caller picks one
    pub tool: Option<DiagnosticTool>,
    /// Opaque parameters handed to the tool adapter
    #[serde(default)]
    pub tool_params: String,
    pub status: SessionStatus,
    /// Participating instances, frozen at creation
    pub instances: Vec<String>,
    #[serde(default)]
    pub active_instances: Vec<ActiveInstance>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl Session {
    /// Build an unsubmitted session request.
    pub fn new(
        tool: Option<DiagnosticTool>,
        tool_params: impl Into<String>,
        instances: Vec<String>,
    ) -> Self {
        Self {
            session_id: String::new(),
            tool,
            tool_params: tool_params.into(),
            status: SessionStatus::Active,
            instances,
            active_instances: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// Whether `name` is one of the expected participants (case-insensitive).
    pub fn includes_instance(&self, name: &str) -> bool {
        self.instances.iter().any(|i| same_instance(i, name))
    }

    /// Progress record for `name`, if that instance has written one.
    pub fn active_instance(&self, name: &str) -> Option<&ActiveInstance> {
        self.active_instances.iter().find(|i| i.is_named(name))
    }

    /// Progress record for `name`, appended on first use.
    pub fn active_instance_entry(&mut self, name: &str) -> &mut ActiveInstance {
        let index = match self.active_instances.iter().position(|i| i.is_named(name)) {
            Some(index) => index,
            None => {
                self.active_instances.push(ActiveInstance::new(name));
                self.active_instances.len() - 1
            }
        };
        &mut self.active_instances[index]
    }

    /// Case-folded names of instances that reported completion.
    pub fn completed_instances(&self) -> BTreeSet<String> {
        self.active_instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Complete)
            .map(|i| fold_instance_name(&i.name))
            .collect()
    }

    /// True when the completed set equals the expected set, compared case-insensitively.
    pub fn is_fully_collected(&self) -> bool {
        let expected: BTreeSet<String> =
            self.instances.iter().map(|i| fold_instance_name(i)).collect();
        self.completed_instances() == expected
    }

    /// Expected instances that have not reported completion yet.
    pub fn pending_instances(&self) -> Vec<&str> {
        let done = self.completed_instances();
        self.instances
            .iter()
            .filter(|i| !done.contains(&fold_instance_name(i)))
            .map(String::as_str)
            .collect()
    }

    /// All artifacts recorded across instances.
    pub fn logs(&self) -> impl Iterator<Item = &LogFile> {
        self.active_instances.iter().flat_map(|i| i.logs.iter())
    }

    /// Session file name inside a store directory.
    pub fn file_name(session_id: &str) -> String {
        format!("{}.json", session_id)
    }
}
