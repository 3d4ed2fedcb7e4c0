//! Session lifecycle coordination
//!
//! The coordinator drives one diagnostics session across every instance of a
//! scaled-out service. Instances share nothing but the file system, so every
//! change to a session record is a locked read-modify-write through
//! [`SessionLock`]:
//!
//! ```text
//! submit ──► active/<id>.json (Active)
//!              │
//!              │  per instance, each step under the session lock:
//!              │    mark Started ─► run tool ─► archive artifacts
//!              │    ─► append logs/errors ─► mark Complete
//!              ▼
//!        completion check (all instances Complete, or forced)
//!              │
//!              ▼
//!        completed/<id>.json (Complete | TimedOut), lock marker removed
//! ```
//!
//! Locked updates never propagate errors. They report an [`UpdateOutcome`]
//! and log what happened. Only submission preconditions, an unknown tool and
//! cancellation surface as `Err`.

use crate::archive::ArtifactArchiver;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::identity::{Clock, InstanceIdentity, SystemClock};
use crate::lock::{FileSessionLock, LockPolicy, SessionLock};
use crate::store::{SessionPhase, SessionStore};
use crate::tools::{DiagnosticToolAdapter, ToolOutput, ToolRegistry};
use crate::types::{ActiveInstance, InstanceStatus, Session, SessionStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Lock key serializing submissions cluster-wide.
pub const SUBMISSION_LOCK_KEY: &str = "submission";

/// Fixed-width, lexically sortable UTC timestamp with millisecond resolution.
pub const SESSION_ID_FORMAT: &str = "%Y%m%d_%H%M%S%3f";

/// Result of one locked read-modify-write.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The record was rewritten.
    Applied,
    /// The lock could not be taken within budget; the marker was reclaimed
    /// and this update was dropped.
    SkippedLockTimeout,
    /// The update failed after the lock was taken (or taking it errored).
    Failed(String),
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied)
    }
}

/// What one instance's collection run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub session_id: String,
    pub instance: String,
    /// Marking this instance Started
    pub started: UpdateOutcome,
    /// Appending archived artifacts and tool errors
    pub artifacts_recorded: UpdateOutcome,
    /// Marking this instance Complete
    pub marked_complete: UpdateOutcome,
    /// Artifacts copied to permanent storage
    pub archived: usize,
    /// Artifacts lost to copy failures
    pub dropped: usize,
    pub tool_errors: Vec<String>,
    /// Whether this run's completion check closed the session
    pub session_completed: bool,
}

/// What a scheduler tick decided.
#[derive(Debug, Clone)]
pub enum PollAction {
    /// No active session
    Idle,
    /// This instance is not a participant
    NotInScope { session_id: String },
    /// This instance already collected; a completion check ran
    AlreadyCollected {
        session_id: String,
        session_completed: bool,
    },
    /// This instance ran its capture
    Collected(RunReport),
    /// The session outlived its maximum duration and was force-completed
    ForcedCompletion { session_id: String, completed: bool },
}

/// Coordinates session submission, per-instance collection and completion.
pub struct SessionCoordinator {
    store: SessionStore,
    lock: Arc<dyn SessionLock>,
    lock_policy: LockPolicy,
    tools: ToolRegistry,
    archiver: ArtifactArchiver,
    identity: InstanceIdentity,
    clock: Arc<dyn Clock>,
    scratch_root: PathBuf,
    max_session_duration: chrono::Duration,
}

impl SessionCoordinator {
    /// Create a coordinator with file locks next to the active store.
    pub fn new(
        store: SessionStore,
        tools: ToolRegistry,
        archiver: ArtifactArchiver,
        identity: InstanceIdentity,
    ) -> Self {
        let lock = Arc::new(FileSessionLock::new(store.phase_dir(SessionPhase::Active)));
        Self {
            store,
            lock,
            lock_policy: LockPolicy::default(),
            tools,
            archiver,
            identity,
            clock: Arc::new(SystemClock),
            scratch_root: std::env::temp_dir().join("clusterdiag"),
            max_session_duration: chrono::Duration::minutes(30),
        }
    }

    /// Build everything from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            SessionStore::new(config.storage.root()),
            ToolRegistry::from_config(&config.tools),
            ArtifactArchiver::from_config(config),
            InstanceIdentity::from_config(&config.instance),
        )
        .with_lock_policy(LockPolicy::from(&config.lock))
        .with_scratch_root(config.storage.scratch_root())
        .with_max_session_duration(config.session.max_duration())
    }

    pub fn with_lock(mut self, lock: Arc<dyn SessionLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    pub fn with_max_session_duration(mut self, duration: chrono::Duration) -> Self {
        self.max_session_duration = duration;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    // ============================================
    // Queries (lock-free, possibly stale)
    // ============================================

    /// The active session, if any.
    pub async fn get_active_session(&self) -> Result<Option<Session>> {
        Ok(self
            .store
            .list(SessionPhase::Active)
            .await?
            .into_iter()
            .next())
    }

    /// Every readable session from both stores.
    pub async fn get_all_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions = self.store.list(SessionPhase::Active).await?;
        sessions.extend(self.store.list(SessionPhase::Completed).await?);
        Ok(sessions)
    }

    /// Look a session up by id in either store.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        if let Some(session) = self.store.load(SessionPhase::Active, session_id).await? {
            return Ok(Some(session));
        }
        self.store.load(SessionPhase::Completed, session_id).await
    }

    /// Whether this instance is one of the session's participants.
    pub fn should_collect_on_current_instance(&self, session: &Session) -> bool {
        session.includes_instance(self.identity.full_instance_id())
    }

    /// Whether this instance already reported completion for the session.
    pub fn has_this_instance_collected_logs(&self, session: &Session) -> bool {
        session
            .active_instance(self.identity.full_instance_id())
            .map(|i| i.status == InstanceStatus::Complete)
            .unwrap_or(false)
    }

    /// Whether the session has outlived the administrative timeout.
    pub fn is_session_expired(&self, session: &Session) -> bool {
        self.clock.now().signed_duration_since(session.start_time) >= self.max_session_duration
    }

    // ============================================
    // Submission
    // ============================================

    /// Persist a new session as the single active one and return its id.
    ///
    /// Fails with [`Error::SessionAlreadyActive`] or [`Error::ToolNotSpecified`]
    /// without touching storage.
    pub async fn submit_new_session(&self, mut session: Session) -> Result<String> {
        let guard = self
            .lock_policy
            .acquire(&self.lock, SUBMISSION_LOCK_KEY)
            .await?
            .ok_or_else(|| Error::LockUnavailable(SUBMISSION_LOCK_KEY.to_string()))?;

        if let Some(active) = self.get_active_session().await? {
            tracing::info!(
                active_session = %active.session_id,
                "Rejecting submission, a session is already active"
            );
            return Err(Error::SessionAlreadyActive);
        }

        let tool = session.tool.ok_or(Error::ToolNotSpecified)?;

        let now = self.clock.now();
        session.session_id = now.format(SESSION_ID_FORMAT).to_string();
        session.status = SessionStatus::Active;
        session.start_time = now;
        session.end_time = None;
        session.active_instances.clear();

        self.store.save(SessionPhase::Active, &session).await?;
        guard.release().await;

        tracing::info!(
            session_id = %session.session_id,
            tool = %tool,
            instances = session.instances.len(),
            "Session submitted"
        );
        Ok(session.session_id)
    }

    // ============================================
    // Per-instance collection
    // ============================================

    /// Run this instance's capture for `session` and record the results.
    ///
    /// Cancellation aborts the tool invocation only; steps already committed
    /// (the Started mark) stay in place and a later run may re-enter.
    pub async fn run_tool_for_session(
        &self,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let tool = session.tool.ok_or(Error::ToolNotSpecified)?;
        let adapter = self.tools.resolve(tool)?;

        let session_id = session.session_id.clone();
        let instance = self.identity.full_instance_id().to_string();
        let short_id = self.identity.short_instance_id().to_string();

        tracing::info!(
            session_id = %session_id,
            instance = %instance,
            tool = %tool,
            "Starting collection on this instance"
        );

        let started = self
            .update_session(&session_id, |s| {
                if s.status == SessionStatus::Active {
                    s.status = SessionStatus::Started;
                }
                let entry = s.active_instance_entry(&instance);
                if entry.status != InstanceStatus::Complete {
                    entry.status = InstanceStatus::Started;
                }
            })
            .await;

        // A stale snapshot may point at a session another instance already
        // closed; capturing now would archive files no record references.
        if !self.is_still_active(&session_id).await? {
            tracing::warn!(
                session_id = %session_id,
                instance = %instance,
                started = ?started,
                "Session is no longer active, skipping collection"
            );
            return Err(Error::SessionNotFound(session_id));
        }

        let scratch_dir = self.scratch_root.join(&session_id).join(&short_id);
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::warn!(
                    session_id = %session_id,
                    instance = %instance,
                    "Collection cancelled while the tool was running"
                );
                return Err(Error::Cancelled);
            }
            output = self.invoke_tool(adapter.as_ref(), session, &scratch_dir) => output,
        };

        let mut logs = Vec::with_capacity(output.logs.len());
        let mut dropped = 0;
        for log in output.logs {
            let source = log.full_path.clone();
            match self.archiver.archive(&session_id, &short_id, log).await {
                Ok(archived) => logs.push(archived),
                Err(e) => {
                    dropped += 1;
                    tracing::warn!(
                        session_id = %session_id,
                        path = %source.display(),
                        error = %e,
                        "Dropping artifact that could not be archived"
                    );
                }
            }
        }
        let archived = logs.len();
        let tool_errors = output.errors;

        let errors = tool_errors.clone();
        let artifacts_recorded = self
            .update_instance(&session_id, move |entry| {
                entry.logs.extend(logs);
                entry.errors.extend(errors);
            })
            .await;

        let marked_complete = self
            .update_instance(&session_id, |entry| {
                entry.status = InstanceStatus::Complete;
            })
            .await;

        let session_completed = self.check_and_complete_session_if_needed(session, false).await;

        tracing::info!(
            session_id = %session_id,
            instance = %instance,
            archived,
            dropped,
            tool_errors = tool_errors.len(),
            session_completed,
            "Collection finished on this instance"
        );

        Ok(RunReport {
            session_id,
            instance,
            started,
            artifacts_recorded,
            marked_complete,
            archived,
            dropped,
            tool_errors,
            session_completed,
        })
    }

    async fn is_still_active(&self, session_id: &str) -> Result<bool> {
        Ok(self
            .store
            .load(SessionPhase::Active, session_id)
            .await?
            .map(|s| !s.status.is_terminal())
            .unwrap_or(false))
    }

    /// Invoke the adapter, folding a failure to run it into the output errors.
    ///
    /// The scratch dir starts empty so files left by an aborted earlier run
    /// are never reported as artifacts of this one.
    async fn invoke_tool(
        &self,
        adapter: &dyn DiagnosticToolAdapter,
        session: &Session,
        scratch_dir: &Path,
    ) -> ToolOutput {
        let result = match reset_dir(scratch_dir).await {
            Ok(()) => {
                adapter
                    .invoke(
                        &session.tool_params,
                        scratch_dir,
                        self.identity.short_instance_id(),
                    )
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(
                    session_id = %session.session_id,
                    tool = %adapter.tool(),
                    error = %e,
                    "Diagnostic tool failed"
                );
                ToolOutput {
                    logs: vec![],
                    errors: vec![e.to_string()],
                }
            }
        }
    }

    // ============================================
    // Completion
    // ============================================

    /// Close the session if every expected instance is Complete, or if forced.
    ///
    /// A normal close ends `Complete`; a forced close always ends `TimedOut`.
    ///
    /// On success the record is stamped and moved to the completed store and
    /// the lock marker is removed. Returns false with no effect otherwise.
    pub async fn check_and_complete_session_if_needed(
        &self,
        session: &Session,
        force_completion: bool,
    ) -> bool {
        let session_id = session.session_id.as_str();

        // Cheap lock-free check before contending for the lock
        if !force_completion {
            match self.store.load(SessionPhase::Active, session_id).await {
                Ok(Some(current)) if current.is_fully_collected() => {}
                Ok(_) => return false,
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "Could not read session for completion check");
                    return false;
                }
            }
        }

        let guard = match self.lock_policy.acquire(&self.lock, session_id).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::warn!(session_id, "Skipping completion check, lock unavailable");
                return false;
            }
            Err(e) => {
                tracing::error!(session_id, error = %e, "Failed to take lock for completion");
                return false;
            }
        };

        let result = self.complete_locked(session_id, force_completion).await;
        guard.release().await;

        match result {
            Ok(completed) => completed,
            Err(e) => {
                tracing::error!(session_id, error = %e, "Failed to complete session");
                false
            }
        }
    }

    async fn complete_locked(&self, session_id: &str, force_completion: bool) -> Result<bool> {
        let Some(mut current) = self.store.load(SessionPhase::Active, session_id).await? else {
            return Ok(false);
        };

        if !force_completion && !current.is_fully_collected() {
            return Ok(false);
        }

        current.status = if force_completion {
            SessionStatus::TimedOut
        } else {
            SessionStatus::Complete
        };
        current.end_time = Some(self.clock.now());
        self.store.move_to_completed(&current).await?;

        tracing::info!(
            session_id,
            status = %current.status,
            pending = ?current.pending_instances(),
            "Session completed"
        );
        Ok(true)
    }

    // ============================================
    // Scheduler tick
    // ============================================

    /// One tick of this instance's scheduler.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<PollAction> {
        let Some(session) = self.get_active_session().await? else {
            return Ok(PollAction::Idle);
        };
        let session_id = session.session_id.clone();

        if self.is_session_expired(&session) {
            tracing::warn!(
                session_id = %session_id,
                pending = ?session.pending_instances(),
                "Session exceeded its maximum duration, forcing completion"
            );
            let completed = self.check_and_complete_session_if_needed(&session, true).await;
            return Ok(PollAction::ForcedCompletion {
                session_id,
                completed,
            });
        }

        if !self.should_collect_on_current_instance(&session) {
            return Ok(PollAction::NotInScope { session_id });
        }

        if self.has_this_instance_collected_logs(&session) {
            let session_completed = self.check_and_complete_session_if_needed(&session, false).await;
            return Ok(PollAction::AlreadyCollected {
                session_id,
                session_completed,
            });
        }

        let report = self.run_tool_for_session(&session, cancel).await?;
        Ok(PollAction::Collected(report))
    }

    // ============================================
    // Locked read-modify-write
    // ============================================

    /// Reload the active record under its lock, apply `update`, write it back.
    async fn update_session<F>(&self, session_id: &str, update: F) -> UpdateOutcome
    where
        F: FnOnce(&mut Session) + Send,
    {
        let guard = match self.lock_policy.acquire(&self.lock, session_id).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::warn!(session_id, "Skipping session update, lock unavailable");
                return UpdateOutcome::SkippedLockTimeout;
            }
            Err(e) => {
                tracing::error!(session_id, error = %e, "Failed to take session lock");
                return UpdateOutcome::Failed(e.to_string());
            }
        };

        let result = self.apply_update(session_id, update).await;
        guard.release().await;

        match result {
            Ok(()) => UpdateOutcome::Applied,
            Err(e) => {
                tracing::error!(session_id, error = %e, "Session update failed");
                UpdateOutcome::Failed(e.to_string())
            }
        }
    }

    async fn apply_update<F>(&self, session_id: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut Session) + Send,
    {
        let mut session = self
            .store
            .load(SessionPhase::Active, session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        update(&mut session);
        self.store.save(SessionPhase::Active, &session).await
    }

    /// Locked update of this instance's progress record.
    async fn update_instance<F>(&self, session_id: &str, update: F) -> UpdateOutcome
    where
        F: FnOnce(&mut ActiveInstance) + Send,
    {
        let name = self.identity.full_instance_id().to_string();
        self.update_session(session_id, move |session| {
            update(session.active_instance_entry(&name));
        })
        .await
    }
}

async fn reset_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}
