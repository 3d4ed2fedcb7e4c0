//! Integration tests for the session lifecycle
//!
//! These tests drive several coordinators (one per simulated instance) over a
//! shared temporary store, with fake capture tools standing in for real ones.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use clusterdiag_core::coordinator::{PollAction, UpdateOutcome};
use clusterdiag_core::{
    ArtifactArchiver, Clock, DiagnosticTool, DiagnosticToolAdapter, Error, InstanceIdentity,
    InstanceStatus, LockPolicy, LogFile, MemorySessionLock, Session, SessionCoordinator,
    SessionLock, SessionPhase, SessionStatus, SessionStore, ToolOutput, ToolRegistry,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ============================================
// Test doubles
// ============================================

/// Capture tool that writes the named files into the scratch dir.
struct FakeTool {
    tool: DiagnosticTool,
    delay: Duration,
    files: Vec<&'static str>,
    /// Reported but never written, so archival fails for them
    missing: Vec<&'static str>,
    errors: Vec<&'static str>,
}

impl FakeTool {
    fn dump(files: &[&'static str]) -> Self {
        Self {
            tool: DiagnosticTool::MemoryDump,
            delay: Duration::ZERO,
            files: files.to_vec(),
            missing: vec![],
            errors: vec![],
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl DiagnosticToolAdapter for FakeTool {
    fn tool(&self) -> DiagnosticTool {
        self.tool
    }

    async fn invoke(
        &self,
        params: &str,
        scratch_dir: &Path,
        instance_short_id: &str,
    ) -> clusterdiag_core::Result<ToolOutput> {
        tokio::time::sleep(self.delay).await;

        let mut output = ToolOutput::default();
        for name in &self.files {
            let path = scratch_dir.join(name);
            tokio::fs::write(&path, format!("{}:{}", instance_short_id, params)).await?;
            output.logs.push(LogFile::new(path));
        }
        for name in &self.missing {
            output.logs.push(LogFile::new(scratch_dir.join(name)));
        }
        output.errors = self.errors.iter().map(|e| e.to_string()).collect();
        Ok(output)
    }
}

struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(
            Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap(),
        )))
    }

    fn advance(&self, by: chrono::Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

struct Cluster {
    temp: TempDir,
    clock: Arc<FixedClock>,
    lock: Arc<MemorySessionLock>,
}

impl Cluster {
    fn new() -> Self {
        clusterdiag_core::logging::init_test();
        Self {
            temp: TempDir::new().expect("failed to create temp dir"),
            clock: FixedClock::new(),
            lock: Arc::new(MemorySessionLock::new()),
        }
    }

    fn store(&self) -> SessionStore {
        SessionStore::new(self.temp.path().join("share/sessions"))
    }

    fn archive_dir(&self) -> std::path::PathBuf {
        self.temp.path().join("share/logs")
    }

    /// Coordinator for one instance, sharing store, lock and clock.
    fn instance(&self, name: &str, tool: FakeTool) -> SessionCoordinator {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(tool));

        SessionCoordinator::new(
            self.store(),
            tools,
            ArtifactArchiver::new(self.archive_dir(), "app.example.net", "logs"),
            InstanceIdentity::new(name),
        )
        .with_lock(self.lock.clone())
        .with_clock(self.clock.clone())
        .with_scratch_root(self.temp.path().join("scratch").join(name))
        .with_lock_policy(LockPolicy {
            max_attempts: 2000,
            retry_interval: Duration::from_millis(1),
        })
    }
}

fn request(instances: &[&str]) -> Session {
    Session::new(
        Some(DiagnosticTool::MemoryDump),
        "--full",
        instances.iter().map(|s| s.to_string()).collect(),
    )
}

// ============================================
// Lifecycle scenarios
// ============================================

#[tokio::test]
async fn test_two_instance_session_completes_after_both_report() {
    let cluster = Cluster::new();
    let a = cluster.instance("A", FakeTool::dump(&["core.dmp"]));
    let b = cluster.instance("B", FakeTool::dump(&[]));
    let cancel = CancellationToken::new();

    let id = a.submit_new_session(request(&["A", "B"])).await.unwrap();
    let session = a.get_active_session().await.unwrap().unwrap();
    assert_eq!(session.session_id, id);
    assert_eq!(session.status, SessionStatus::Active);

    // A collects; B is still missing
    let report = a.run_tool_for_session(&session, &cancel).await.unwrap();
    assert!(report.started.is_applied());
    assert!(report.artifacts_recorded.is_applied());
    assert!(report.marked_complete.is_applied());
    assert_eq!(report.archived, 1);
    assert!(!report.session_completed);

    let mid = a.get_active_session().await.unwrap().unwrap();
    assert_eq!(mid.status, SessionStatus::Started);
    let a_entry = mid.active_instance("A").unwrap();
    assert_eq!(a_entry.status, InstanceStatus::Complete);
    assert_eq!(a_entry.logs.len(), 1);
    assert_eq!(a_entry.logs[0].name, "core.dmp");
    let a_short = a.identity().short_instance_id();
    assert_eq!(
        a_entry.logs[0].relative_path.as_deref(),
        Some(format!("https://app.example.net/api/vfs/logs/{}/{}_core.dmp", id, a_short).as_str())
    );
    assert!(!a.check_and_complete_session_if_needed(&mid, false).await);
    assert!(a.store().load(SessionPhase::Active, &id).await.unwrap().is_some());

    // B collects; now every instance is done
    let report = b.run_tool_for_session(&mid, &cancel).await.unwrap();
    assert!(report.session_completed);

    assert!(b.get_active_session().await.unwrap().is_none());
    let done = b
        .store()
        .load(SessionPhase::Completed, &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, SessionStatus::Complete);
    assert_eq!(done.end_time, Some(cluster.clock.now()));
    assert_eq!(done.active_instances.len(), 2);
    assert!(cluster
        .archive_dir()
        .join(&id)
        .join(format!("{}_core.dmp", a_short))
        .exists());
    assert!(!cluster.lock.is_held(&id).unwrap());
}

#[tokio::test]
async fn test_completion_preserves_record_and_removes_marker() {
    let cluster = Cluster::new();
    let a = cluster.instance("A", FakeTool::dump(&["one.dmp", "two.dmp"]));
    let cancel = CancellationToken::new();

    let id = a.submit_new_session(request(&["a"])).await.unwrap();
    let session = a.get_session(&id).await.unwrap().unwrap();

    let report = a.run_tool_for_session(&session, &cancel).await.unwrap();
    assert!(report.session_completed);

    let completed = a
        .store()
        .load(SessionPhase::Completed, &id)
        .await
        .unwrap()
        .unwrap();

    // Every field survived the move
    assert_eq!(completed.session_id, id);
    assert_eq!(completed.tool, Some(DiagnosticTool::MemoryDump));
    assert_eq!(completed.tool_params, "--full");
    assert_eq!(completed.instances, vec!["a".to_string()]);
    assert_eq!(completed.start_time, session.start_time);
    let entry = completed.active_instance("A").unwrap();
    assert_eq!(entry.logs.len(), 2);
    assert!(entry.logs.iter().all(|l| l.size > 0));

    let listed = a.get_all_sessions().await.unwrap();
    assert_eq!(listed, vec![completed]);
    assert!(!cluster.lock.is_held(&id).unwrap());
}

#[tokio::test]
async fn test_file_lock_marker_removed_after_completion() {
    clusterdiag_core::logging::init_test();
    let temp = TempDir::new().unwrap();
    let store = SessionStore::new(temp.path().join("sessions"));
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(FakeTool::dump(&["x.dmp"])));

    let coord = SessionCoordinator::new(
        store.clone(),
        tools,
        ArtifactArchiver::new(temp.path().join("logs"), "h", "logs"),
        InstanceIdentity::new("solo"),
    )
    .with_scratch_root(temp.path().join("scratch"));

    let id = coord.submit_new_session(request(&["solo"])).await.unwrap();
    let session = coord.get_session(&id).await.unwrap().unwrap();
    let report = coord
        .run_tool_for_session(&session, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.session_completed);

    let active_dir = store.phase_dir(SessionPhase::Active);
    assert!(!active_dir.join(format!("{}.json", id)).exists());
    assert!(!active_dir.join(format!("{}.json.lock", id)).exists());
    assert!(store
        .phase_dir(SessionPhase::Completed)
        .join(format!("{}.json", id))
        .exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interleaved_instances_never_lose_updates() {
    let cluster = Cluster::new();
    let a = cluster.instance(
        "A",
        FakeTool::dump(&["a1.dmp", "a2.dmp"]).with_delay(Duration::from_millis(5)),
    );
    let b = cluster.instance(
        "B",
        FakeTool::dump(&["b1.dmp"]).with_delay(Duration::from_millis(3)),
    );
    let c = cluster.instance("C", FakeTool::dump(&["c1.dmp"]));
    let cancel = CancellationToken::new();

    let id = a.submit_new_session(request(&["A", "B", "C"])).await.unwrap();
    let session = a.get_session(&id).await.unwrap().unwrap();

    let (ra, rb) = tokio::join!(
        a.run_tool_for_session(&session, &cancel),
        b.run_tool_for_session(&session, &cancel)
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    for report in [&ra, &rb] {
        assert!(report.started.is_applied());
        assert!(report.artifacts_recorded.is_applied());
        assert!(report.marked_complete.is_applied());
        assert!(!report.session_completed);
    }

    let current = a.get_active_session().await.unwrap().unwrap();
    assert_eq!(current.active_instances.len(), 2);
    assert_eq!(current.active_instance("A").unwrap().logs.len(), 2);
    assert_eq!(current.active_instance("B").unwrap().logs.len(), 1);

    let rc = c.run_tool_for_session(&current, &cancel).await.unwrap();
    assert!(rc.session_completed);
    let done = c.get_session(&id).await.unwrap().unwrap();
    assert_eq!(done.status, SessionStatus::Complete);
    assert_eq!(done.logs().count(), 4);
}

#[tokio::test]
async fn test_instances_sharing_a_name_prefix_keep_separate_artifacts() {
    let cluster = Cluster::new();
    let one = cluster.instance("web-server-1", FakeTool::dump(&["core.dmp"]));
    let two = cluster.instance("web-server-2", FakeTool::dump(&["core.dmp"]));
    let cancel = CancellationToken::new();

    let id = one
        .submit_new_session(request(&["web-server-1", "web-server-2"]))
        .await
        .unwrap();
    let session = one.get_session(&id).await.unwrap().unwrap();
    one.run_tool_for_session(&session, &cancel).await.unwrap();
    let report = two.run_tool_for_session(&session, &cancel).await.unwrap();
    assert!(report.session_completed);

    let done = one.get_session(&id).await.unwrap().unwrap();
    let paths: Vec<_> = done
        .logs()
        .map(|l| l.relative_path.clone().unwrap())
        .collect();
    assert_eq!(paths.len(), 2);
    assert_ne!(paths[0], paths[1]);

    let mut archived: Vec<_> = std::fs::read_dir(cluster.archive_dir().join(&id))
        .unwrap()
        .map(|e| std::fs::read_to_string(e.unwrap().path()).unwrap())
        .collect();
    archived.sort();
    let mut expected = vec![
        format!("{}:--full", one.identity().short_instance_id()),
        format!("{}:--full", two.identity().short_instance_id()),
    ];
    expected.sort();
    assert_eq!(archived, expected);
}

#[tokio::test]
async fn test_run_on_closed_session_captures_nothing() {
    let cluster = Cluster::new();
    let a = cluster.instance("A", FakeTool::dump(&[]));
    let b = cluster.instance("B", FakeTool::dump(&["core.dmp"]));

    let id = a.submit_new_session(request(&["A", "B"])).await.unwrap();
    let stale = a.get_session(&id).await.unwrap().unwrap();
    assert!(a.check_and_complete_session_if_needed(&stale, true).await);

    let err = b
        .run_tool_for_session(&stale, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(ref s) if *s == id));

    assert!(!cluster.archive_dir().join(&id).exists());
    let done = a.get_session(&id).await.unwrap().unwrap();
    assert_eq!(done.status, SessionStatus::TimedOut);
    assert!(done.active_instances.is_empty());
    assert!(!cluster.lock.is_held(&id).unwrap());
}

#[tokio::test]
async fn test_orphaned_lock_skips_update_without_error() {
    let cluster = Cluster::new();
    let a = cluster
        .instance("A", FakeTool::dump(&["core.dmp"]))
        .with_lock_policy(LockPolicy {
            max_attempts: 3,
            retry_interval: Duration::from_millis(1),
        });

    let id = a.submit_new_session(request(&["A"])).await.unwrap();
    let session = a.get_session(&id).await.unwrap().unwrap();

    // A crashed instance left the session lock behind
    assert!(cluster.lock.try_acquire(&id, "crashed-instance").unwrap());

    let report = a
        .run_tool_for_session(&session, &CancellationToken::new())
        .await
        .expect("lock timeout must not surface as an error");
    assert_eq!(report.started, UpdateOutcome::SkippedLockTimeout);

    // Later steps ran after the marker was reclaimed
    assert!(report.artifacts_recorded.is_applied());
    assert!(report.marked_complete.is_applied());
    assert!(report.session_completed);
}

#[tokio::test]
async fn test_artifact_copy_failure_drops_only_that_artifact() {
    let cluster = Cluster::new();
    let mut tool = FakeTool::dump(&["good.dmp"]);
    tool.missing = vec!["vanished.dmp"];
    tool.errors = vec!["dump truncated"];
    let a = cluster.instance("A", tool);

    let id = a.submit_new_session(request(&["A", "B"])).await.unwrap();
    let session = a.get_session(&id).await.unwrap().unwrap();

    let report = a
        .run_tool_for_session(&session, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.archived, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.tool_errors, vec!["dump truncated".to_string()]);

    let current = a.get_session(&id).await.unwrap().unwrap();
    let entry = current.active_instance("A").unwrap();
    assert_eq!(entry.status, InstanceStatus::Complete);
    assert_eq!(entry.logs.len(), 1);
    assert_eq!(entry.logs[0].name, "good.dmp");
    assert_eq!(entry.errors, vec!["dump truncated".to_string()]);
}

#[tokio::test]
async fn test_cancellation_keeps_started_mark_and_allows_retry() {
    let cluster = Cluster::new();
    let slow = cluster.instance(
        "A",
        FakeTool::dump(&["core.dmp"]).with_delay(Duration::from_secs(30)),
    );

    let id = slow.submit_new_session(request(&["A"])).await.unwrap();
    let session = slow.get_session(&id).await.unwrap().unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = slow.run_tool_for_session(&session, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    let current = slow.get_session(&id).await.unwrap().unwrap();
    assert_eq!(
        current.active_instance("A").unwrap().status,
        InstanceStatus::Started
    );
    assert!(!cluster.lock.is_held(&id).unwrap());

    // A retry re-enters and completes
    let fast = cluster.instance("A", FakeTool::dump(&["core.dmp"]));
    let report = fast
        .run_tool_for_session(&current, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.session_completed);
}

#[tokio::test]
async fn test_at_most_one_active_session_across_submissions() {
    let cluster = Cluster::new();
    let a = cluster.instance("A", FakeTool::dump(&[]));

    for round in 0..3 {
        let id = a.submit_new_session(request(&["A", "B"])).await.unwrap();
        for _ in 0..2 {
            assert!(matches!(
                a.submit_new_session(request(&["A"])).await,
                Err(Error::SessionAlreadyActive)
            ));
        }

        let active = a.store().list(SessionPhase::Active).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, id);

        let session = a.get_session(&id).await.unwrap().unwrap();
        assert!(a.check_and_complete_session_if_needed(&session, true).await);
        assert!(a.get_active_session().await.unwrap().is_none());

        cluster.clock.advance(chrono::Duration::seconds(1));
        assert_eq!(a.get_all_sessions().await.unwrap().len(), round + 1);
    }
}

#[tokio::test]
async fn test_concurrent_submissions_admit_one() {
    let cluster = Cluster::new();
    let a = cluster.instance("A", FakeTool::dump(&[]));
    let b = cluster.instance("B", FakeTool::dump(&[]));

    let (ra, rb) = tokio::join!(
        a.submit_new_session(request(&["A", "B"])),
        b.submit_new_session(request(&["A", "B"]))
    );
    let admitted = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(admitted, 1);
    assert_eq!(
        a.store().list(SessionPhase::Active).await.unwrap().len(),
        1
    );
}

// ============================================
// Scheduler ticks
// ============================================

#[tokio::test]
async fn test_poll_once_paths() {
    let cluster = Cluster::new();
    let a = cluster.instance("A", FakeTool::dump(&["core.dmp"]));
    let outsider = cluster.instance("Z", FakeTool::dump(&[]));
    let cancel = CancellationToken::new();

    assert!(matches!(a.poll_once(&cancel).await.unwrap(), PollAction::Idle));

    let id = a.submit_new_session(request(&["A", "B"])).await.unwrap();

    match outsider.poll_once(&cancel).await.unwrap() {
        PollAction::NotInScope { session_id } => assert_eq!(session_id, id),
        other => panic!("unexpected action: {:?}", other),
    }

    match a.poll_once(&cancel).await.unwrap() {
        PollAction::Collected(report) => {
            assert_eq!(report.archived, 1);
            assert!(!report.session_completed);
        }
        other => panic!("unexpected action: {:?}", other),
    }

    match a.poll_once(&cancel).await.unwrap() {
        PollAction::AlreadyCollected {
            session_id,
            session_completed,
        } => {
            assert_eq!(session_id, id);
            assert!(!session_completed);
        }
        other => panic!("unexpected action: {:?}", other),
    }

    // B never reports; the administrative timeout closes the session
    cluster.clock.advance(chrono::Duration::minutes(31));
    match a.poll_once(&cancel).await.unwrap() {
        PollAction::ForcedCompletion {
            session_id,
            completed,
        } => {
            assert_eq!(session_id, id);
            assert!(completed);
        }
        other => panic!("unexpected action: {:?}", other),
    }

    let done = a.get_session(&id).await.unwrap().unwrap();
    assert_eq!(done.status, SessionStatus::TimedOut);
    assert_eq!(done.pending_instances(), vec!["B"]);
    assert!(matches!(a.poll_once(&cancel).await.unwrap(), PollAction::Idle));
}
