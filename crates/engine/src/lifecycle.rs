//! Environment test state machine
//!
//! ```text
//! OPENED -> IN_PROGRESS -> TEST_COMPLETED | TEST_FAILED | FAILED
//!        -> COMPLETED <-> IN_PROGRESS      (manual review)
//!        -> CLOSED -> (snapshotted status)  (close / reopen)
//! ```

use crate::archive::Archiver;
use lumen_common::{now, Database, Error, Result, RunStatus, TestRun};
use tracing::{error, info};

#[derive(Clone)]
pub struct Lifecycle {
    db: Database,
    archiver: Archiver,
}

impl Lifecycle {
    pub fn new(db: Database, archiver: Archiver) -> Self {
        Self { db, archiver }
    }

    pub fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    /// Move a run into execution; only opened or failed runs may start
    pub fn start(&self, run_id: &str) -> Result<TestRun> {
        let run = self.db.require_run(run_id)?;
        if !matches!(run.status, RunStatus::Opened | RunStatus::Failed) {
            return Err(transition(run.status, RunStatus::InProgress));
        }
        if run.status == RunStatus::Failed {
            let reset = self.db.restart_run(run_id, RunStatus::InProgress, now())?;
            info!("Run {} restarted ({} test cases rearmed)", run_id, reset);
        } else {
            self.db.mark_run_started(run_id, RunStatus::InProgress, now())?;
            info!("Run {} started", run_id);
        }
        self.db.require_run(run_id)
    }

    /// Terminal status once the executor has visited every page
    pub fn finish(&self, run_id: &str, pages: usize, errored: usize) -> Result<RunStatus> {
        let status = if pages > 0 && errored == pages {
            RunStatus::Failed
        } else if self.db.needs_manual_check(run_id)? {
            RunStatus::TestFailed
        } else {
            RunStatus::TestCompleted
        };
        self.db.mark_run_ended(run_id, status, now())?;

        if status == RunStatus::Failed {
            error!("Run {} failed: all {} pages errored", run_id, pages);
        } else {
            info!(
                "Run {} finished as {} ({} of {} pages errored)",
                run_id, status, errored, pages
            );
        }
        Ok(status)
    }

    /// Settle a run whose executor stopped before `finish`
    pub fn abort(&self, run_id: &str, reason: &str) -> Result<()> {
        self.db.mark_run_ended(run_id, RunStatus::Failed, now())?;
        error!("Run {} aborted: {}", run_id, reason);
        Ok(())
    }

    /// Re-evaluate a run after a manual target decision
    ///
    /// Runs still being executed keep their status; `finish` settles them.
    pub fn on_target_updated(&self, run_id: &str) -> Result<RunStatus> {
        let run = self.db.require_run(run_id)?;
        if matches!(run.status, RunStatus::Opened | RunStatus::Closed) || is_executing(&run) {
            return Ok(run.status);
        }

        let needs_check = self.db.needs_manual_check(run_id)?;
        let next = if !needs_check && run.status != RunStatus::Completed {
            RunStatus::Completed
        } else if needs_check && run.status == RunStatus::Completed {
            RunStatus::InProgress
        } else {
            return Ok(run.status);
        };

        self.db.set_run_status(run_id, next)?;
        info!("Run {} moved {} -> {} after review", run_id, run.status, next);
        Ok(next)
    }

    /// Archive the bulk rows, then mark the run closed
    pub fn close(&self, run_id: &str) -> Result<TestRun> {
        let run = self.db.require_run(run_id)?;
        if is_executing(&run) {
            return Err(transition(run.status, RunStatus::Closed));
        }

        self.archiver.archive(run_id)?;
        if run.status != RunStatus::Closed {
            self.db.mark_run_ended(run_id, RunStatus::Closed, now())?;
            info!("Run {} closed", run_id);
        }
        self.db.require_run(run_id)
    }

    /// Restore the bulk rows; the run resumes its snapshotted status
    pub fn reopen(&self, run_id: &str) -> Result<TestRun> {
        let run = self.db.require_run(run_id)?;
        if run.status != RunStatus::Closed {
            return Err(transition(run.status, RunStatus::Opened));
        }

        match self.archiver.unarchive(run_id)? {
            Some(status) => info!("Run {} reopened as {}", run_id, status),
            None => {
                self.db.set_run_status(run_id, RunStatus::Opened)?;
                info!("Run {} reopened without a snapshot", run_id);
            }
        }
        self.db.require_run(run_id)
    }
}

/// The executor owns the run until it stamps an end time
fn is_executing(run: &TestRun) -> bool {
    run.status == RunStatus::InProgress && run.ended_at.is_none()
}

fn transition(from: RunStatus, to: RunStatus) -> Error {
    Error::InvalidStateTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}
