use async_trait::async_trait;
use clap::Parser;
use shared::config::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

mod client;
mod docker;
mod orchestrator;
mod uploads;

use client::{DispatcherClient, TokenRefresher};
use docker::DockerManager;
use orchestrator::{TaskWorker, TaskWorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "task-worker")]
struct Cli {
    /// Run this single task to completion, then exit, matching how a
    /// per-task container is launched with a pre-reserved id. When omitted,
    /// the process polls and reserves tasks for itself in a loop.
    #[arg(long)]
    task_id: Option<Uuid>,

    /// Offliners this worker is willing to run; unset means any.
    #[arg(long, value_delimiter = ',')]
    offliners: Vec<String>,
}

/// Bearer tokens are issued by the SSH-key-signing grant, external to this
/// crate; this refresher only re-reads whatever an external agent has
/// already placed in `ZIMFARM_ACCESS_TOKEN`.
struct EnvTokenRefresher;

#[async_trait]
impl TokenRefresher for EnvTokenRefresher {
    async fn refresh(&self) -> anyhow::Result<String> {
        std::env::var("ZIMFARM_ACCESS_TOKEN")
            .map_err(|_| anyhow::anyhow!("ZIMFARM_ACCESS_TOKEN is not set"))
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let settings = Settings::new().unwrap_or_else(|e| {
        tracing::warn!(%e, "failed to load settings, using defaults");
        Settings::new().expect("settings must be constructible from defaults alone")
    });

    let docker = DockerManager::connect(&settings.docker_socket)?;
    let client = DispatcherClient::new(settings.web_api_uri.clone(), Arc::new(EnvTokenRefresher));
    let should_stop = orchestrator::install_signal_handler();
    let workdir = PathBuf::from(&settings.workdir);

    let make_config = |task_id: Uuid| TaskWorkerConfig {
        task_id,
        worker_name: settings.worker_name.clone(),
        username: settings.username.clone(),
        workdir: workdir.clone(),
        host_workdir_mounts: workdir.clone(),
        use_public_dns: settings.use_public_dns,
        upload_uri: settings.upload_uri.clone(),
        rsa_key_path: settings.rsa_key.clone(),
    };

    if let Some(task_id) = cli.task_id {
        info!(%task_id, "task-worker starting for a single pre-reserved task");
        let mut worker = TaskWorker::new(make_config(task_id), client, docker, should_stop);
        if let Err(e) = worker.run().await {
            error!(%task_id, %e, "task run failed");
            std::process::exit(1);
        }
        return Ok(());
    }

    let advertised = shared::model::ResourceSpec {
        cpu: settings.zimfarm_cpus,
        memory: settings.zimfarm_memory,
        disk: settings.zimfarm_disk_space,
        shm: None,
    };

    info!(worker = %settings.worker_name, "task-worker polling for work");
    while !should_stop.load(std::sync::atomic::Ordering::SeqCst) {
        let used = docker.used_resources().await.unwrap_or_else(|e| {
            tracing::warn!(%e, "failed to query in-use container resources, advertising full capacity");
            shared::model::ResourceSpec::default()
        });
        let available = docker::clamp_resources(advertised, used);

        match client
            .reserve(&settings.worker_name, &settings.username, available, &cli.offliners)
            .await
        {
            Ok(Some(task)) => {
                info!(task_id = %task.id, "reserved task, running it");
                let mut worker = TaskWorker::new(make_config(task.id), client.clone(), docker.clone(), should_stop.clone());
                if let Err(e) = worker.run().await {
                    error!(task_id = %task.id, %e, "task run failed");
                }
            }
            Ok(None) => tokio::time::sleep(std::time::Duration::from_secs(30)).await,
            Err(e) => {
                error!(%e, "failed to poll for reservable tasks");
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            }
        }
    }

    Ok(())
}
