//! Append-only run directory used to resume interrupted judging runs.
//!
//! Layout of a run directory:
//!
//! ```text
//! run.json         run id and creation time
//! per_item.jsonl   one ScoredItem per line, appended as units complete
//! ```
//!
//! A row's presence in `per_item.jsonl` is its completion marker, and the
//! verdicts it carries say which raters are done with it. A row missing a
//! rater is completed later by appending a fuller row for the same key,
//! which supersedes the earlier one. Rows are flushed and synced after every
//! unit, so a crash loses at most the unit that was in flight. A torn
//! trailing line is cut off before new rows are appended.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{ItemType, JudgeTask, JudgeVerdict, ScoredItem};

pub const ROWS_FILE: &str = "per_item.jsonl";
pub const MANIFEST_FILE: &str = "run.json";

/// Completion marker of one task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkUnitKey {
    pub configuration: String,
    pub topic: String,
    pub item_type: ItemType,
    pub seed: u32,
    pub source_hash: String,
    pub row_index: u64,
}

impl WorkUnitKey {
    pub fn for_task(task: &JudgeTask) -> Self {
        Self {
            configuration: task.group.configuration.clone(),
            topic: task.group.topic.clone(),
            item_type: task.group.item_type,
            seed: task.group.seed,
            source_hash: task.group.source_hash.clone(),
            row_index: task.row_index,
        }
    }

    pub fn for_item(item: &ScoredItem) -> Self {
        Self {
            configuration: item.group.configuration.clone(),
            topic: item.group.topic.clone(),
            item_type: item.group.item_type,
            seed: item.group.seed,
            source_hash: item.group.source_hash.clone(),
            row_index: item.row_index,
        }
    }
}

/// Identity of a run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Completed rows of a run plus an append handle for new ones.
pub struct ResumeStore {
    dir: PathBuf,
    manifest: RunManifest,
    /// Position of each key's current row in `rows`.
    index: HashMap<WorkUnitKey, usize>,
    rows: Vec<ScoredItem>,
    writer: BufWriter<File>,
}

impl ResumeStore {
    /// Open `run_dir`, loading any rows already committed there.
    pub fn open(run_dir: &Path) -> Result<Self, StoreError> {
        Self::open_with(run_dir, true)
    }

    /// Open `run_dir` discarding previously committed rows.
    pub fn fresh(run_dir: &Path) -> Result<Self, StoreError> {
        Self::open_with(run_dir, false)
    }

    fn open_with(run_dir: &Path, resume: bool) -> Result<Self, StoreError> {
        fs::create_dir_all(run_dir).map_err(io_err(run_dir))?;

        let manifest_path = run_dir.join(MANIFEST_FILE);
        let manifest = match (resume, manifest_path.exists()) {
            (true, true) => {
                let text = fs::read_to_string(&manifest_path).map_err(io_err(&manifest_path))?;
                serde_json::from_str(&text)?
            }
            _ => {
                let m = RunManifest {
                    run_id: Uuid::new_v4(),
                    created_at: Utc::now(),
                };
                let text = serde_json::to_string_pretty(&m)?;
                fs::write(&manifest_path, text).map_err(io_err(&manifest_path))?;
                m
            }
        };

        let rows_path = run_dir.join(ROWS_FILE);
        let rows = if resume && rows_path.exists() {
            trim_torn_tail(&rows_path)?;
            load_rows(&rows_path)?
        } else {
            Vec::new()
        };
        let index = key_positions(&rows);

        let file = OpenOptions::new()
            .create(true)
            .append(resume)
            .write(true)
            .truncate(!resume)
            .open(&rows_path)
            .map_err(io_err(&rows_path))?;

        if !rows.is_empty() {
            tracing::info!(
                run_id = %manifest.run_id,
                rows = rows.len(),
                "resuming from {}",
                rows_path.display()
            );
        }

        Ok(Self {
            dir: run_dir.to_path_buf(),
            manifest,
            index,
            rows,
            writer: BufWriter::new(file),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.manifest.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether any row is committed for `key`.
    pub fn is_done(&self, key: &WorkUnitKey) -> bool {
        self.index.contains_key(key)
    }

    /// Verdicts already committed for `key`.
    pub fn verdicts(&self, key: &WorkUnitKey) -> Option<&BTreeMap<String, JudgeVerdict>> {
        self.index.get(key).map(|&i| &self.rows[i].judge_verdicts)
    }

    /// Number of committed rows.
    pub fn completed(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[ScoredItem] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<ScoredItem> {
        self.rows
    }

    /// Commit one unit of rows: write, flush and sync before returning.
    pub fn append(&mut self, rows: &[ScoredItem]) -> Result<(), StoreError> {
        let path = self.dir.join(ROWS_FILE);
        for row in rows {
            let line = serde_json::to_string(row)?;
            writeln!(self.writer, "{line}").map_err(io_err(&path))?;
        }
        self.writer.flush().map_err(io_err(&path))?;
        self.writer.get_ref().sync_data().map_err(io_err(&path))?;

        for row in rows {
            let key = WorkUnitKey::for_item(row);
            match self.index.get(&key) {
                Some(&i) => self.rows[i] = row.clone(),
                None => {
                    self.index.insert(key, self.rows.len());
                    self.rows.push(row.clone());
                }
            }
        }
        tracing::debug!(rows = rows.len(), total = self.rows.len(), "checkpoint flushed");
        Ok(())
    }
}

/// Read a run directory without modifying it.
pub fn load_run(run_dir: &Path) -> Result<(RunManifest, Vec<ScoredItem>), StoreError> {
    let manifest_path = run_dir.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(StoreError::NotARun(run_dir.display().to_string()));
    }
    let text = fs::read_to_string(&manifest_path).map_err(io_err(&manifest_path))?;
    let manifest = serde_json::from_str(&text)?;

    let rows_path = run_dir.join(ROWS_FILE);
    let rows = if rows_path.exists() {
        load_rows(&rows_path)?
    } else {
        Vec::new()
    };
    Ok((manifest, rows))
}

fn key_positions(rows: &[ScoredItem]) -> HashMap<WorkUnitKey, usize> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| (WorkUnitKey::for_item(row), i))
        .collect()
}

/// Cut a partially written last line so the next append starts on a fresh
/// line. Returns the number of bytes removed.
fn trim_torn_tail(path: &Path) -> Result<u64, StoreError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    if bytes.last().map_or(true, |&b| b == b'\n') {
        return Ok(0);
    }
    let keep = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |p| p + 1);
    let file = OpenOptions::new().write(true).open(path).map_err(io_err(path))?;
    file.set_len(keep as u64).map_err(io_err(path))?;
    file.sync_data().map_err(io_err(path))?;

    let removed = (bytes.len() - keep) as u64;
    tracing::warn!(bytes = removed, "discarded torn trailing row in {}", path.display());
    Ok(removed)
}

/// Load committed rows. A later row for the same key supersedes an earlier
/// one; unreadable lines are skipped with a warning.
fn load_rows(path: &Path) -> Result<Vec<ScoredItem>, StoreError> {
    let file = File::open(path).map_err(io_err(path))?;
    let mut rows: Vec<ScoredItem> = Vec::new();
    let mut position: HashMap<WorkUnitKey, usize> = HashMap::new();

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_err(path))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ScoredItem>(&line) {
            Ok(row) => {
                let key = WorkUnitKey::for_item(&row);
                match position.get(&key) {
                    Some(&idx) => {
                        tracing::debug!(line = lineno + 1, "row superseded by later record");
                        rows[idx] = row;
                    }
                    None => {
                        position.insert(key, rows.len());
                        rows.push(row);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(line = lineno + 1, "skipping unreadable checkpoint row: {e}");
            }
        }
    }
    Ok(rows)
}

/// Append serializable records to a JSONL file, one per line, flushing
/// before returning.
pub fn append_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    let mut w = BufWriter::new(file);
    for record in records {
        let line = serde_json::to_string(record)?;
        writeln!(w, "{line}").map_err(io_err(path))?;
    }
    w.flush().map_err(io_err(path))?;
    Ok(())
}
