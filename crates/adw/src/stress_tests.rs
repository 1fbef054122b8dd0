//! Stress tests for the phase queue, run state store, resource allocator
//! and observability log under repeated or high-volume access.
//!
//! These tests verify behavior under load, not correctness of a single
//! call — the assertions mirror the single-call tests in each module, run
//! many times or against many rows, to catch anything that only shows up
//! under volume (lock contention, file growth, row-count drift).

#[cfg(test)]
mod tests {
    use crate::allocator::ResourceAllocator;
    use crate::events::{EventLog, ObservabilityEvent};
    use crate::history::HistoryRecorder;
    use crate::queue::PhaseQueue;
    use crate::state_store::RunStateStore;
    use adw_types::{ErrorKind, PhaseName, QueueStatus, RunStateDocument, WorkflowTemplate};
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn stress_allocate_release_cycle() {
        let temp_dir = TempDir::new().unwrap();
        let allocator = ResourceAllocator::new(
            temp_dir.path().join("agents"),
            temp_dir.path().join("worktrees"),
        );

        for i in 0..100 {
            let run_id = format!("run-{i}");
            let (allocation, _wt) = allocator
                .allocate(&run_id)
                .unwrap_or_else(|_| panic!("allocate failed on iteration {i}"));
            assert_ne!(allocation.backend_port, allocation.frontend_port);
            allocator
                .release(&run_id)
                .unwrap_or_else(|_| panic!("release failed on iteration {i}"));
        }
    }

    #[test]
    fn stress_state_save_load_cycle() {
        let temp_dir = TempDir::new().unwrap();
        let store = RunStateStore::new(temp_dir.path().join("agents"));

        for i in 0..50 {
            let run_id = format!("run-{i}");
            let mut doc = RunStateDocument::new(run_id.clone(), WorkflowTemplate::FullSdlc);
            doc.plan_file_path = Some(format!("/tmp/{run_id}/PLAN.md").into());
            store
                .save(&run_id, &doc)
                .unwrap_or_else(|_| panic!("save failed on iteration {i}"));
            let loaded = store
                .require(&run_id)
                .unwrap_or_else(|_| panic!("load failed on iteration {i}"));
            assert_eq!(loaded.run_id, run_id);
        }
    }

    #[test]
    fn stress_queue_enqueue_and_full_phase_walk() {
        let q = PhaseQueue::open_in_memory().unwrap();
        let now = Utc::now();

        for i in 0..30 {
            let run_id = format!("run-{i}");
            let ids = q.enqueue_run(&run_id, None, now).unwrap();
            assert_eq!(ids.len(), 10);
        }

        // Walk run-0's ten phases from ready through completed, verifying
        // each dependent unblocks exactly once its predecessor finishes.
        for n in 1..=10u8 {
            let queue_id = format!("run-0-p{n}");
            q.transition(&queue_id, QueueStatus::Running, None, now)
                .unwrap();
            q.transition(&queue_id, QueueStatus::Completed, None, now)
                .unwrap();
            q.mark_dependents_ready("run-0", n, now).unwrap();
        }
        let rows = q.get_by_run("run-0").unwrap();
        assert!(rows.iter().all(|r| r.status == QueueStatus::Completed));
    }

    #[test]
    fn stress_concurrent_transition_attempts_lose_cleanly() {
        let q = PhaseQueue::open_in_memory().unwrap();
        let now = Utc::now();
        q.enqueue_run(&"run-1".to_string(), None, now).unwrap();
        q.transition("run-1-p1", QueueStatus::Running, None, now)
            .unwrap();
        q.transition("run-1-p1", QueueStatus::Completed, None, now)
            .unwrap();

        // Many stale workers all believing the row is still `running`;
        // every one of them must lose the race, not just the first.
        for _ in 0..20 {
            assert!(q
                .transition("run-1-p1", QueueStatus::Failed, None, now)
                .is_err());
        }
    }

    #[test]
    fn stress_recover_stale_running_at_scale() {
        let q = PhaseQueue::open_in_memory().unwrap();
        let started = Utc::now();
        for i in 0..40 {
            let run_id = format!("run-{i}");
            q.enqueue_run(&run_id, None, started).unwrap();
            q.transition(&format!("{run_id}-p1"), QueueStatus::Running, None, started)
                .unwrap();
        }

        let now = started + chrono::Duration::hours(2);
        let recovered = q
            .recover_stale_running(chrono::Duration::minutes(30), now)
            .unwrap();
        assert_eq!(recovered.len(), 40);
    }

    #[test]
    fn stress_event_log_append_many() {
        let temp_dir = TempDir::new().unwrap();
        let log = EventLog::new(temp_dir.path().to_path_buf());

        for i in 0..1000 {
            let event = ObservabilityEvent {
                run_id: format!("run-{}", i % 100),
                phase: PhaseName::Build,
                status: QueueStatus::Running,
                at: Utc::now(),
                attempt: 1,
                error_kind: None,
                detail: None,
            };
            log.append(&event)
                .unwrap_or_else(|_| panic!("append failed on iteration {i}"));
        }

        let loaded = log.read_all("run-0").unwrap();
        assert_eq!(loaded.len(), 10); // run-0 hit on i = 0, 100, 200, ... 900
    }

    #[test]
    fn stress_history_recorder_many_rows() {
        let recorder = HistoryRecorder::open_in_memory().unwrap();
        let now = Utc::now();

        for i in 0..500 {
            recorder
                .record(
                    "run-1",
                    PhaseName::Build,
                    QueueStatus::Completed,
                    now,
                    Some(1000),
                    None,
                    Some("ok"),
                )
                .unwrap_or_else(|_| panic!("record failed on iteration {i}"));
        }

        let rows = recorder.for_run("run-1").unwrap();
        assert_eq!(rows.len(), 500);

        let recent = recorder.recent(10).unwrap();
        assert_eq!(recent.len(), 10);
    }

    #[test]
    fn stress_sequential_state_updates_preserve_latest_write() {
        let temp_dir = TempDir::new().unwrap();
        let store = RunStateStore::new(temp_dir.path().join("agents"));
        let run_id = "run-seq".to_string();
        store
            .save(&run_id, &RunStateDocument::new(run_id.clone(), WorkflowTemplate::FullSdlc))
            .unwrap();

        for i in 0..20 {
            let mut doc = store.require(&run_id).unwrap();
            doc.issue_class = Some(format!("class-{i}"));
            store.save(&run_id, &doc).unwrap();
        }

        let last = store.require(&run_id).unwrap();
        assert_eq!(last.issue_class, Some("class-19".to_string()));
    }

    #[test]
    fn stress_failed_to_ready_retries_accumulate_correctly() {
        let q = PhaseQueue::open_in_memory().unwrap();
        let now = Utc::now();
        q.enqueue_run(&"run-1".to_string(), None, now).unwrap();

        for expected in 1..=5u32 {
            q.transition("run-1-p1", QueueStatus::Running, None, now)
                .unwrap();
            let failed = q
                .transition(
                    "run-1-p1",
                    QueueStatus::Failed,
                    Some(ErrorKind::ExternalToolFailure),
                    now,
                )
                .unwrap();
            assert_eq!(failed.retry_count, expected - 1);
            let retried = q
                .transition("run-1-p1", QueueStatus::Ready, None, now)
                .unwrap();
            assert_eq!(retried.retry_count, expected);
        }
    }
}
