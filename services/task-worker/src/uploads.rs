//! The Upload Manager (C6): drains `*.zim` files out of a task's workdir
//! through the `openzim/uploader` container, one at a time, retrying failed
//! transfers up to `MAX_ZIM_RETRIES` times.

use shared::model::FileStatus;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const MAX_ZIM_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Zim,
    Log,
}

#[derive(Debug, Clone)]
struct Tracked {
    status: FileStatus,
    retries: u32,
}

/// One instance per running task. `tick()` is called once per supervision
/// pass; it never blocks — container lifecycle is driven by the caller via
/// the returned [`UploadAction`].
pub struct UploadManager {
    files: HashMap<String, Tracked>,
    current: Option<String>,
}

/// What the orchestrator should do this tick, decided purely from
/// `UploadManager`'s bookkeeping — the orchestrator performs the actual
/// docker/API calls and reports the outcome back via `record_result`.
#[derive(Debug, PartialEq, Eq)]
pub enum UploadAction {
    /// No uploader in flight and nothing pending: idle this tick.
    Idle,
    /// Start an uploader for this filename.
    Start(String),
    /// An uploader is already running; nothing to do.
    Wait,
}

impl Default for UploadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadManager {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            current: None,
        }
    }

    /// Scans `workdir` for `*.zim` files not yet tracked, registering each as
    /// `Pending`. Returns the newly discovered filenames so the caller can
    /// emit `created_file` events.
    pub fn discover(&mut self, workdir: &Path) -> std::io::Result<Vec<(String, u64)>> {
        let mut discovered = Vec::new();
        let entries = match std::fs::read_dir(workdir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(discovered),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("zim") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if self.files.contains_key(name) {
                continue;
            }
            let size = entry.metadata()?.len();
            self.files.insert(
                name.to_string(),
                Tracked {
                    status: FileStatus::Pending,
                    retries: 0,
                },
            );
            discovered.push((name.to_string(), size));
        }
        Ok(discovered)
    }

    /// §4.6 step 1-2: if an uploader is in flight, wait; otherwise start one
    /// for the next pending file, oldest-registered first.
    pub fn tick(&mut self) -> UploadAction {
        if self.current.is_some() {
            return UploadAction::Wait;
        }
        let next = self
            .files
            .iter()
            .find(|(_, t)| t.status == FileStatus::Pending)
            .map(|(name, _)| name.clone());
        match next {
            Some(name) => {
                self.current = Some(name.clone());
                if let Some(t) = self.files.get_mut(&name) {
                    t.status = FileStatus::Uploading;
                }
                UploadAction::Start(name)
            }
            None => UploadAction::Idle,
        }
    }

    /// §4.6 step 3: records the outcome of the uploader started by the last
    /// `Start` action. On failure, re-queues as `Pending` up to
    /// `MAX_ZIM_RETRIES` times; beyond that the file is marked `Failed` for
    /// good and `report` tells the caller to emit `failed_file`.
    pub fn record_result(&mut self, filename: &str, succeeded: bool) -> UploadOutcome {
        self.current = None;
        let Some(tracked) = self.files.get_mut(filename) else {
            return UploadOutcome::Unknown;
        };
        if succeeded {
            tracked.status = FileStatus::Uploaded;
            return UploadOutcome::Uploaded;
        }
        tracked.retries += 1;
        if tracked.retries >= MAX_ZIM_RETRIES {
            tracked.status = FileStatus::Failed;
            UploadOutcome::ExhaustedRetries
        } else {
            tracked.status = FileStatus::Pending;
            UploadOutcome::WillRetry { attempt: tracked.retries }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.files
            .values()
            .filter(|t| matches!(t.status, FileStatus::Pending | FileStatus::Uploading))
            .count()
    }

    pub fn all_done(&self) -> bool {
        self.pending_count() == 0 && self.current.is_none()
    }

    /// Whether any tracked file exhausted its retry budget (§4.6 step 2) —
    /// the authoritative per-file outcome, unlike the `Task` snapshot fetched
    /// once at the start of the run, which never reflects uploads that
    /// happen afterwards.
    pub fn any_failed(&self) -> bool {
        self.files.values().any(|t| t.status == FileStatus::Failed)
    }

    pub fn status_of(&self, filename: &str) -> Option<FileStatus> {
        self.files.get(filename).map(|t| t.status)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    WillRetry { attempt: u32 },
    ExhaustedRetries,
    Unknown,
}

/// The scraper log follows a different upload lifecycle than ZIM files: it
/// is re-uploaded ("watch" mode) while the scraper runs, then a final
/// one-shot upload once it stops (supplemented from the original's
/// `upload_log` method, which is called on every supervision tick and
/// again once after the scraper exits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogUploadMode {
    Watch,
    Oneshot,
}

pub fn log_upload_dir(mode: LogUploadMode) -> &'static str {
    match mode {
        LogUploadMode::Watch | LogUploadMode::Oneshot => "logs",
    }
}

pub fn zim_upload_dir(warehouse_path: &str) -> String {
    format!("zim{warehouse_path}")
}

pub fn workdir_for(base: &Path, task_id: uuid::Uuid) -> PathBuf {
    base.join(task_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_next_pending_file_and_waits_while_in_flight() {
        let mut mgr = UploadManager::new();
        mgr.files.insert(
            "a.zim".into(),
            Tracked { status: FileStatus::Pending, retries: 0 },
        );
        assert_eq!(mgr.tick(), UploadAction::Start("a.zim".into()));
        assert_eq!(mgr.tick(), UploadAction::Wait);
    }

    #[test]
    fn retries_failed_upload_up_to_max_then_marks_failed() {
        let mut mgr = UploadManager::new();
        mgr.files.insert(
            "a.zim".into(),
            Tracked { status: FileStatus::Uploading, retries: 0 },
        );
        mgr.current = Some("a.zim".into());

        for attempt in 1..MAX_ZIM_RETRIES {
            let outcome = mgr.record_result("a.zim", false);
            assert_eq!(outcome, UploadOutcome::WillRetry { attempt });
            assert_eq!(mgr.status_of("a.zim"), Some(FileStatus::Pending));
            mgr.tick();
        }

        let outcome = mgr.record_result("a.zim", false);
        assert_eq!(outcome, UploadOutcome::ExhaustedRetries);
        assert_eq!(mgr.status_of("a.zim"), Some(FileStatus::Failed));
    }

    #[test]
    fn successful_upload_marks_uploaded_and_frees_slot_for_next_file() {
        let mut mgr = UploadManager::new();
        mgr.files.insert("a.zim".into(), Tracked { status: FileStatus::Pending, retries: 0 });
        mgr.files.insert("b.zim".into(), Tracked { status: FileStatus::Pending, retries: 0 });

        let UploadAction::Start(first) = mgr.tick() else { panic!("expected start") };
        assert_eq!(mgr.record_result(&first, true), UploadOutcome::Uploaded);

        let UploadAction::Start(second) = mgr.tick() else { panic!("expected start") };
        assert_ne!(first, second);
    }

    #[test]
    fn discover_ignores_non_zim_files_and_existing_entries() {
        let dir = std::env::temp_dir().join(format!("uploads-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("out.zim"), b"123").unwrap();
        std::fs::write(dir.join("notes.txt"), b"x").unwrap();

        let mut mgr = UploadManager::new();
        let found = mgr.discover(&dir).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "out.zim");

        let found_again = mgr.discover(&dir).unwrap();
        assert!(found_again.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }
}
