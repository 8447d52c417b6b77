//! The Task-Worker Orchestrator (C5): given a `task_id`, runs the scraper
//! pipeline to completion and reports status back to the dispatcher.
//! Structured the way the original `TaskWorker` class is — bound task,
//! docker client, dispatcher client and per-run state, with the §4.5
//! algorithm spread across `start`, `supervise_tick` and `finalize`.

use crate::client::{ClientError, DispatcherClient};
use crate::docker::DockerManager;
use crate::uploads::{workdir_for, zim_upload_dir, LogUploadMode, UploadAction, UploadManager};
use serde_json::json;
use shared::model::Task;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// 60 s supervision cadence (§4.5 step 8), observed in 1 s increments so
/// `should_stop` is honoured promptly (§5's concurrency note).
const SUPERVISION_INTERVAL: Duration = Duration::from_secs(60);
const COOPERATIVE_SLEEP: Duration = Duration::from_secs(1);
const STOP_TIMEOUT_SECS: i64 = 5;
/// §5: if the last 100 log lines of the scraper container haven't changed
/// for this long, it's considered stuck and killed.
const STUCK_CONTAINER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub struct TaskWorkerConfig {
    pub task_id: Uuid,
    pub worker_name: String,
    pub username: String,
    pub workdir: PathBuf,
    pub host_workdir_mounts: PathBuf,
    pub use_public_dns: bool,
    pub upload_uri: String,
    pub rsa_key_path: String,
}

/// One run of the orchestrator, bound to a single task. Mirrors the
/// original's `TaskWorker` instance fields: the fetched task, per-run docker
/// handles, and upload bookkeeping.
pub struct TaskWorker {
    cfg: TaskWorkerConfig,
    client: DispatcherClient,
    docker: DockerManager,
    should_stop: Arc<AtomicBool>,
    task: Option<Task>,
    task_workdir: Option<PathBuf>,
    host_task_workdir: Option<PathBuf>,
    dnscache_name: Option<String>,
    scraper_name: Option<String>,
    scraper_succeeded: Option<bool>,
    uploads: UploadManager,
    uploading_filename: Option<String>,
    last_scraper_log: Option<String>,
    last_scraper_log_change: std::time::Instant,
}

impl TaskWorker {
    pub fn new(
        cfg: TaskWorkerConfig,
        client: DispatcherClient,
        docker: DockerManager,
        should_stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            client,
            docker,
            should_stop,
            task: None,
            task_workdir: None,
            host_task_workdir: None,
            dnscache_name: None,
            scraper_name: None,
            scraper_succeeded: None,
            uploads: UploadManager::new(),
            uploading_filename: None,
            last_scraper_log: None,
            last_scraper_log_change: std::time::Instant::now(),
        }
    }

    fn task_id(&self) -> Uuid {
        self.cfg.task_id
    }

    async fn patch(&self, event: &str, payload: serde_json::Value) {
        if let Err(e) = self.client.patch_task_event(self.task_id(), event, payload).await {
            warn!(task_id = %self.task_id(), event, %e, "couldn't report event to dispatcher");
        }
    }

    /// Steps 1-7: fetch the task, mark it started, set up the workdir, DNS
    /// cache and scraper, then the watch-mode log uploader.
    pub async fn start(&mut self) -> anyhow::Result<bool> {
        let task = match self.client.get_task(self.task_id()).await {
            Ok(t) => t,
            Err(ClientError::Status(404)) => {
                error!(task_id = %self.task_id(), "task doesn't exist, can't run it");
                return Ok(false);
            }
            Err(e) => {
                error!(task_id = %self.task_id(), %e, "couldn't fetch task detail");
                return Ok(false);
            }
        };
        if task.status.is_terminal() {
            warn!(task_id = %self.task_id(), status = %task.status, "task is already terminal");
            return Ok(false);
        }
        self.task = Some(task);

        self.patch("started", json!({})).await;

        let workdir = workdir_for(&self.cfg.workdir, self.task_id());
        std::fs::create_dir_all(&workdir)?;
        self.task_workdir = Some(workdir.clone());
        self.host_task_workdir = Some(self.cfg.host_workdir_mounts.join(self.task_id().to_string()));

        info!(task_id = %self.task_id(), "starting DNS cache");
        let (dns_name, dns_ip) = self
            .docker
            .start_dnscache(self.task_id(), self.cfg.use_public_dns)
            .await?;
        self.dnscache_name = Some(dns_name);

        let task = self.task.as_ref().expect("task set above");
        let schedule_name = task.schedule_name.clone().unwrap_or_default();
        let host_workdir = self
            .host_task_workdir
            .as_ref()
            .expect("set above")
            .to_string_lossy()
            .to_string();

        info!(task_id = %self.task_id(), "starting scraper container");
        let scraper_name = self
            .docker
            .start_scraper(self.task_id(), &schedule_name, &task.config, &dns_ip, &host_workdir)
            .await?;
        self.scraper_name = Some(scraper_name.clone());

        let command_info = task.config.command_information.clone();
        let log_path = self.docker.log_path(&scraper_name).await.ok();
        self.patch(
            "scraper_started",
            json!({
                "image": format!("{}:{}", task.config.image.name, task.config.image.tag),
                "command": command_info.as_ref().map(|c| &c.command),
                "log": log_path.as_ref().and_then(|p| std::path::Path::new(p).file_name()).map(|n| n.to_string_lossy().to_string()),
            }),
        )
        .await;

        self.start_log_uploader(LogUploadMode::Watch).await;

        Ok(true)
    }

    async fn start_log_uploader(&self, _mode: LogUploadMode) {
        let Some(scraper_name) = &self.scraper_name else { return };
        let Ok(log_path) = self.docker.log_path(scraper_name).await else { return };
        let path = std::path::Path::new(&log_path);
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else { return };
        let Some(host_dir) = path.parent().and_then(|p| p.to_str()) else { return };
        if let Err(e) = self
            .docker
            .start_uploader(
                self.task_id(),
                &self.cfg.username,
                host_dir,
                &self.cfg.upload_uri,
                "logs",
                filename,
                false,
                &self.cfg.rsa_key_path,
            )
            .await
        {
            warn!(task_id = %self.task_id(), %e, "failed to start log uploader");
        }
    }

    /// Step 8: one supervision pass. Returns `true` while the scraper is
    /// still running.
    pub async fn supervise_tick(&mut self) -> anyhow::Result<bool> {
        let scraper_name = self.scraper_name.clone().expect("start() must run first");

        if let Some(workdir) = self.task_workdir.clone() {
            for (filename, size) in self.uploads.discover(&workdir)? {
                self.patch("created_file", json!({"file": {"name": filename, "size": size}})).await;
            }
        }

        self.drive_uploads().await;

        if self.scraper_is_stuck(&scraper_name).await {
            warn!(task_id = %self.task_id(), "scraper log unchanged for 10m, killing as stuck");
            self.docker.stop(&scraper_name, STOP_TIMEOUT_SECS).await;
            return Ok(false);
        }

        Ok(self.docker.is_running(&scraper_name).await?)
    }

    /// §5's stuck-container detector: kills a scraper whose last 100 log
    /// lines haven't changed in 10 minutes.
    async fn scraper_is_stuck(&mut self, scraper_name: &str) -> bool {
        let tail = self.docker.logs(scraper_name, "100").await;
        match &self.last_scraper_log {
            Some(prev) if *prev == tail => {
                self.last_scraper_log_change.elapsed() >= STUCK_CONTAINER_TIMEOUT
            }
            _ => {
                self.last_scraper_log = Some(tail);
                self.last_scraper_log_change = std::time::Instant::now();
                false
            }
        }
    }

    async fn drive_uploads(&mut self) {
        let Some(host_workdir) = self.host_task_workdir.clone() else { return };
        let Some(task) = &self.task else { return };
        let warehouse_path = task.config.warehouse_path.clone();

        match self.uploads.tick() {
            UploadAction::Idle | UploadAction::Wait => {}
            UploadAction::Start(filename) => {
                let upload_dir = zim_upload_dir(&warehouse_path);
                let result = self
                    .docker
                    .start_uploader(
                        self.task_id(),
                        &self.cfg.username,
                        &host_workdir.to_string_lossy(),
                        &self.cfg.upload_uri,
                        &upload_dir,
                        &filename,
                        true,
                        &self.cfg.rsa_key_path,
                    )
                    .await;
                if let Err(e) = result {
                    warn!(task_id = %self.task_id(), filename, %e, "failed to start uploader");
                    self.uploads.record_result(&filename, false);
                } else {
                    self.uploading_filename = Some(filename);
                }
            }
        }
    }

    /// If the currently tracked uploader has finished, reap it and feed the
    /// result back into the upload manager.
    async fn poll_in_flight_upload(&mut self) {
        let Some(filename) = self.uploading_filename.clone() else { return };
        if self.docker.is_running(&crate::docker::upload_container_name(self.task_id(), &filename)).await.unwrap_or(true) {
            return;
        }
        self.uploading_filename = None;
        self.reap_finished_uploader(&filename).await;
    }

    /// Polls the currently in-flight uploader (if any) for completion and
    /// feeds the result back into the upload manager, emitting
    /// `uploaded_file`/`failed_file` as appropriate. Call after
    /// `drive_uploads` has had a chance to start one.
    async fn reap_finished_uploader(&mut self, filename: &str) {
        let name = crate::docker::upload_container_name(self.task_id(), filename);
        let exit_code = self.docker.exit_code(&name).await.unwrap_or(None);
        let succeeded = exit_code == Some(0);
        if !succeeded {
            warn!(task_id = %self.task_id(), filename, "uploader failed: {}", self.docker.logs(&name, "200").await);
        }
        self.docker.remove(&name).await;

        match self.uploads.record_result(filename, succeeded) {
            crate::uploads::UploadOutcome::Uploaded => {
                self.patch("uploaded_file", json!({"filename": filename})).await;
            }
            crate::uploads::UploadOutcome::ExhaustedRetries => {
                self.patch("failed_file", json!({"filename": filename})).await;
            }
            crate::uploads::UploadOutcome::WillRetry { attempt } => {
                warn!(task_id = %self.task_id(), filename, attempt, "retrying upload");
            }
            crate::uploads::UploadOutcome::Unknown => {}
        }
    }

    /// Step 9: scraper has exited. Records exit code, finalizes the log
    /// upload in one-shot mode and waits for it.
    async fn handle_stopped_scraper(&mut self) {
        let Some(scraper_name) = self.scraper_name.clone() else { return };
        let exit_code = self.docker.exit_code(&scraper_name).await.unwrap_or(None);
        self.scraper_succeeded = Some(exit_code == Some(0));
        self.patch("scraper_completed", json!({"exit_code": exit_code})).await;

        info!(task_id = %self.task_id(), "finalizing scraper log upload");
        self.start_log_uploader(LogUploadMode::Oneshot).await;
        if let Some(scraper) = &self.scraper_name {
            let log_path = self.docker.log_path(scraper).await.ok();
            if let Some(filename) = log_path
                .as_deref()
                .and_then(|p| std::path::Path::new(p).file_name())
                .and_then(|n| n.to_str())
            {
                let upload_name = crate::docker::upload_container_name(self.task_id(), filename);
                for _ in 0..1200 {
                    if !self.docker.is_running(&upload_name).await.unwrap_or(false) {
                        break;
                    }
                    tokio::time::sleep(COOPERATIVE_SLEEP).await;
                }
                self.docker.remove(&upload_name).await;
            }
        }
    }

    /// Step 11-12: reports the final status with the task-worker's own log
    /// tail attached, then conditionally cleans up the workdir.
    async fn finalize(&mut self, status: &str, extra_payload: serde_json::Value) {
        let log = self
            .docker
            .logs(&crate::docker::task_container_name(self.task_id()), "2000")
            .await;
        let mut payload = extra_payload;
        if let serde_json::Value::Object(ref mut map) = payload {
            map.insert("log".to_string(), json!(log));
        }
        self.patch(status, payload).await;
        self.cleanup_workdir();
    }

    fn cleanup_workdir(&self) {
        let Some(workdir) = &self.task_workdir else { return };
        let zim_files = zim_files_in(workdir);
        if !zim_files.is_empty() {
            error!(task_id = %self.task_id(), ?zim_files, "ZIM files still present, not removing workdir");
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(workdir) {
            error!(task_id = %self.task_id(), %e, "failed to remove workdir");
        }
    }

    async fn stop_all(&self, timeout_secs: i64) {
        if let Some(name) = &self.scraper_name {
            self.docker.stop(name, timeout_secs).await;
            self.docker.remove(name).await;
        }
        if let Some(name) = &self.dnscache_name {
            self.docker.stop(name, timeout_secs).await;
        }
    }

    /// The full §4.5 lifecycle: start, supervise until the scraper exits,
    /// drain uploads, report final status.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        if !self.start().await? {
            return Ok(());
        }

        let mut elapsed = Duration::ZERO;
        loop {
            if self.should_stop.load(Ordering::SeqCst) {
                return self.cancel().await;
            }
            if elapsed >= SUPERVISION_INTERVAL {
                elapsed = Duration::ZERO;
                if !self.supervise_tick().await? {
                    break;
                }
                self.poll_in_flight_upload().await;
            }
            tokio::time::sleep(COOPERATIVE_SLEEP).await;
            elapsed += COOPERATIVE_SLEEP;
        }

        self.handle_stopped_scraper().await;

        while !self.uploads.all_done() {
            if self.should_stop.load(Ordering::SeqCst) {
                return self.cancel().await;
            }
            self.drive_uploads().await;
            self.poll_in_flight_upload().await;
            tokio::time::sleep(COOPERATIVE_SLEEP).await;
        }

        self.stop_all(STOP_TIMEOUT_SECS).await;

        let succeeded = self.scraper_succeeded.unwrap_or(false) && !self.any_file_failed();
        let status = if succeeded { "succeeded" } else { "failed" };
        self.finalize(status, json!({})).await;
        Ok(())
    }

    /// Consults the upload manager, not the `Task` fetched once in `start()`
    /// — that snapshot is never refreshed during the run, so it can't see
    /// files uploaded or failed afterwards.
    fn any_file_failed(&self) -> bool {
        self.uploads.any_failed()
    }

    /// Cancellation path: stop everything, report `canceled`, clean up,
    /// matching the original's `exit_gracefully`.
    async fn cancel(&mut self) -> anyhow::Result<()> {
        info!(task_id = %self.task_id(), "cancellation requested, stopping containers");
        self.stop_all(STOP_TIMEOUT_SECS).await;
        self.patch("canceled", json!({"canceled_by": "signal"})).await;
        self.cleanup_workdir();
        Ok(())
    }
}

/// Installs a ctrl_c + SIGTERM listener that flips `should_stop`, matching
/// the original's `register_signals`.
pub fn install_signal_handler() -> Arc<AtomicBool> {
    let should_stop = Arc::new(AtomicBool::new(false));
    let flag = should_stop.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        flag.store(true, Ordering::SeqCst);
    });

    #[cfg(unix)]
    {
        let flag = should_stop.clone();
        tokio::spawn(async move {
            if let Ok(mut term) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                term.recv().await;
                flag.store(true, Ordering::SeqCst);
            }
        });
    }

    should_stop
}

/// Lists `*.zim` filenames directly under `workdir`. An unreadable or
/// missing directory is treated as empty.
fn zim_files_in(workdir: &std::path::Path) -> Vec<String> {
    std::fs::read_dir(workdir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("zim"))
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("orchestrator-test-{name}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn zim_files_in_reports_present_archives() {
        let dir = scratch_dir("zim-present");
        std::fs::write(dir.join("wikipedia.zim"), b"data").unwrap();
        std::fs::write(dir.join("scraper.log"), b"log").unwrap();

        let found = zim_files_in(&dir);
        assert_eq!(found, vec!["wikipedia.zim".to_string()]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn zim_files_in_is_empty_for_missing_or_clean_dir() {
        let dir = scratch_dir("zim-absent");
        std::fs::write(dir.join("scraper.log"), b"log").unwrap();
        assert!(zim_files_in(&dir).is_empty());
        std::fs::remove_dir_all(&dir).ok();

        let missing = std::env::temp_dir().join(format!("orchestrator-test-missing-{}", Uuid::new_v4()));
        assert!(zim_files_in(&missing).is_empty());
    }

    #[test]
    fn should_stop_flag_starts_clear() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(!flag.load(Ordering::SeqCst));
        flag.store(true, Ordering::SeqCst);
        assert!(flag.load(Ordering::SeqCst));
    }
}
