//! # clusterdiag-core
//!
//! Core library for clusterdiag - cluster-wide diagnostics capture for
//! horizontally scaled services whose instances share only a file system.
//!
//! This library provides:
//! - Domain types for sessions, instances, and artifacts
//! - A file-backed session store with active/completed lifecycle directories
//! - Per-session locks built on atomic exclusive file creation
//! - The session coordinator (submission, collection, completion)
//! - Tool adapters and artifact archival
//! - Configuration management and logging infrastructure
//!
//! ## Guarantees
//!
//! - At most one session is active cluster-wide.
//! - Every write to a session record happens under that session's lock.
//! - A crashed lock holder delays other instances by at most one retry
//!   budget; its marker is then reclaimed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use clusterdiag_core::{Config, DiagnosticTool, Session, SessionCoordinator};
//!
//! # async fn run() -> clusterdiag_core::Result<()> {
//! let config = Config::load()?;
//! let coordinator = SessionCoordinator::from_config(&config);
//!
//! let request = Session::new(
//!     Some(DiagnosticTool::MemoryDump),
//!     "",
//!     vec!["web-0".to_string(), "web-1".to_string()],
//! );
//! let session_id = coordinator.submit_new_session(request).await?;
//! println!("submitted {}", session_id);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use archive::ArtifactArchiver;
pub use config::Config;
pub use coordinator::{PollAction, RunReport, SessionCoordinator, UpdateOutcome};
pub use error::{Error, Result};
pub use identity::{Clock, InstanceIdentity, SystemClock};
pub use lock::{FileSessionLock, LockGuard, LockPolicy, MemorySessionLock, SessionLock};
pub use store::{SessionPhase, SessionStore};
pub use tools::{DiagnosticToolAdapter, ToolOutput, ToolRegistry};
pub use types::*;

// Public modules
pub mod archive;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod format;
pub mod identity;
pub mod lock;
pub mod logging;
pub mod store;
pub mod tools;
pub mod types;
