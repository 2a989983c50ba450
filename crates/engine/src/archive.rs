//! Run snapshots
//!
//! Closing a run moves its bulk rows (page links, page test cases, targets)
//! into `<archive_dir>/<run_id>.json.gz` and deletes them from the live
//! store. The run header stays so the run is still listed.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lumen_common::{
    now, Database, Error, FieldError, PageRole, PageTestCase, Result, RunPage, RunStatus, Target,
    TestRun,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to bring a run's bulk rows back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub version: u32,
    pub archived_at: i64,
    pub run: TestRun,
    pub structured: Vec<RunPage>,
    pub random: Vec<RunPage>,
    pub cases: Vec<PageTestCase>,
    pub targets: Vec<Target>,
}

#[derive(Clone)]
pub struct Archiver {
    db: Database,
    dir: PathBuf,
    page_size: usize,
}

impl Archiver {
    pub fn new(db: Database, dir: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            db,
            dir: dir.into(),
            page_size: page_size.max(1),
        }
    }

    pub fn snapshot_path(&self, run_id: &str) -> Result<PathBuf> {
        let safe = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(Error::Validation(vec![FieldError::new(
                "run_id",
                "must be alphanumeric, '-' or '_'",
            )]));
        }
        Ok(self.dir.join(format!("{}.json.gz", run_id)))
    }

    pub fn is_archived(&self, run_id: &str) -> Result<bool> {
        Ok(self.snapshot_path(run_id)?.exists())
    }

    /// Write the snapshot, then drop the live rows; returns false if a snapshot already existed
    pub fn archive(&self, run_id: &str) -> Result<bool> {
        let path = self.snapshot_path(run_id)?;
        if path.exists() {
            info!("Run {} already archived at {}", run_id, path.display());
            return Ok(false);
        }

        let snapshot = self.collect(run_id)?;
        write_snapshot(&path, &snapshot)?;

        if let Err(e) = self.db.delete_run_bulk(run_id) {
            warn!("Archive of run {} rolled back: {}", run_id, e);
            if let Err(rm) = std::fs::remove_file(&path) {
                warn!("Could not remove snapshot {}: {}", path.display(), rm);
            }
            return Err(e);
        }

        info!(
            "Archived run {} ({} page test cases, {} targets) to {}",
            run_id,
            snapshot.cases.len(),
            snapshot.targets.len(),
            path.display()
        );
        Ok(true)
    }

    /// Restore the live rows and remove the snapshot; returns the restored status, if any
    pub fn unarchive(&self, run_id: &str) -> Result<Option<RunStatus>> {
        let path = self.snapshot_path(run_id)?;
        if !path.exists() {
            debug!("No snapshot for run {}", run_id);
            return Ok(None);
        }

        let snapshot = read_snapshot(&path)?;
        if snapshot.run.id != run_id {
            return Err(Error::Archive(format!(
                "snapshot {} holds run {}",
                path.display(),
                snapshot.run.id
            )));
        }

        let pages: Vec<RunPage> = snapshot
            .structured
            .iter()
            .chain(&snapshot.random)
            .cloned()
            .collect();
        self.db.restore_run_bulk(
            run_id,
            snapshot.run.status,
            &pages,
            &snapshot.cases,
            &snapshot.targets,
        )?;
        std::fs::remove_file(&path)?;

        info!(
            "Restored run {} ({} page test cases, {} targets) as {}",
            run_id,
            snapshot.cases.len(),
            snapshot.targets.len(),
            snapshot.run.status
        );
        Ok(Some(snapshot.run.status))
    }

    fn collect(&self, run_id: &str) -> Result<RunSnapshot> {
        let run = self.db.require_run(run_id)?;
        let (structured, random): (Vec<RunPage>, Vec<RunPage>) = self
            .db
            .list_run_pages(run_id)?
            .into_iter()
            .partition(|p| p.role == PageRole::Structured);

        let mut cases = Vec::new();
        loop {
            let batch = self.db.list_cases_page(run_id, cases.len(), self.page_size)?;
            let done = batch.len() < self.page_size;
            cases.extend(batch);
            if done {
                break;
            }
        }

        let mut targets = Vec::new();
        loop {
            let batch = self.db.list_targets_page(run_id, targets.len(), self.page_size)?;
            let done = batch.len() < self.page_size;
            targets.extend(batch);
            if done {
                break;
            }
        }

        Ok(RunSnapshot {
            version: SNAPSHOT_VERSION,
            archived_at: now(),
            run,
            structured,
            random,
            cases,
            targets,
        })
    }
}

/// Write through a temporary file so a snapshot is either complete or absent
fn write_snapshot(path: &Path, snapshot: &RunSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("gz.tmp");
    let written = (|| -> Result<()> {
        let file = File::create(&tmp)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, snapshot)?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?
            .sync_all()?;
        Ok(())
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(Error::Archive(format!("writing {}: {}", path.display(), e)));
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_snapshot(path: &Path) -> Result<RunSnapshot> {
    let file = File::open(path)?;
    let snapshot: RunSnapshot = serde_json::from_reader(GzDecoder::new(BufReader::new(file)))
        .map_err(|e| Error::Archive(format!("reading {}: {}", path.display(), e)))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(Error::Archive(format!(
            "unsupported snapshot version {} in {}",
            snapshot.version,
            path.display()
        )));
    }
    Ok(snapshot)
}
