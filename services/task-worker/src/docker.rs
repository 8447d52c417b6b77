//! Docker Engine API access for the task lifecycle: dnscache, scraper and
//! uploader containers. Naming scheme and run parameters are grounded on
//! `common/docker.py`.

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::stream::StreamExt;
use shared::model::{ResourceSpec, TaskConfig};
use std::collections::HashMap;
use uuid::Uuid;

const DEFAULT_CPU_SHARE: i64 = 1024;

const RUNNING_STATUSES: &[&str] = &["created", "running", "restarting", "paused"];

fn short_id(task_id: Uuid) -> String {
    task_id.simple().to_string()[..8].to_string()
}

pub fn task_container_name(task_id: Uuid) -> String {
    format!("{}_task", short_id(task_id))
}

pub fn dnscache_container_name(task_id: Uuid) -> String {
    format!("{}_dnscache", short_id(task_id))
}

pub fn scraper_container_name(task_id: Uuid, task_name: &str) -> String {
    format!("{}_scraper_{}", short_id(task_id), task_name)
}

pub fn upload_container_name(task_id: Uuid, filename: &str) -> String {
    let ident = if filename.ends_with(".zim") { "zimup" } else { "logup" };
    format!("{}_{}_{}", short_id(task_id), ident, filename)
}

/// Thin wrapper over a [`bollard::Docker`] handle, scoped to one task-worker
/// process's containers.
#[derive(Clone)]
pub struct DockerManager {
    client: Docker,
}

impl DockerManager {
    pub fn connect(socket_path: &str) -> anyhow::Result<Self> {
        let client = Docker::connect_with_unix(socket_path, 120, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { client })
    }

    async fn pull_image(&self, name: &str, tag: &str) -> anyhow::Result<()> {
        let options = CreateImageOptions {
            from_image: name.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn remove_if_exists(&self, name: &str) {
        let _ = self
            .client
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }

    /// Starts an `openzim/dnscache` container and returns its name and first
    /// IP address, for use as the scraper's `--dns`.
    pub async fn start_dnscache(
        &self,
        task_id: Uuid,
        use_public_dns: bool,
    ) -> anyhow::Result<(String, String)> {
        let name = dnscache_container_name(task_id);
        self.remove_if_exists(&name).await;
        self.pull_image("openzim/dnscache", "latest").await?;

        let config = Config {
            image: Some("openzim/dnscache:latest".to_string()),
            env: Some(vec![format!(
                "USE_PUBLIC_DNS={}",
                if use_public_dns { "yes" } else { "no" }
            )]),
            host_config: Some(HostConfig {
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        self.client
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await?;

        let ip = self.ip_address(&name).await?;
        Ok((name, ip))
    }

    pub async fn ip_address(&self, container_name: &str) -> anyhow::Result<String> {
        let info = self
            .client
            .inspect_container(container_name, None::<InspectContainerOptions>)
            .await?;
        info.network_settings
            .and_then(|n| n.ip_address)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| anyhow::anyhow!("container {container_name} has no IP address yet"))
    }

    /// Starts the scraper container for `task_config`, bind-mounting
    /// `host_workdir` at the offliner's mount point.
    pub async fn start_scraper(
        &self,
        task_id: Uuid,
        schedule_name: &str,
        config: &TaskConfig,
        dns: &str,
        host_workdir: &str,
    ) -> anyhow::Result<String> {
        let name = scraper_container_name(task_id, &config.task_name);
        self.remove_if_exists(&name).await;
        self.pull_image(&config.image.name, &config.image.tag).await?;

        let command_info = config
            .command_information
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("task config is missing expanded command information"))?;

        let mounts = vec![Mount {
            target: Some(command_info.mount_point.clone()),
            source: Some(host_workdir.to_string()),
            typ: Some(MountTypeEnum::BIND),
            ..Default::default()
        }];

        let mut labels = std::collections::HashMap::new();
        labels.insert("zimscraper".to_string(), "yes".to_string());
        labels.insert("task_id".to_string(), task_id.to_string());
        labels.insert("tid".to_string(), short_id(task_id));
        labels.insert("schedule_name".to_string(), schedule_name.to_string());
        if let Some(disk) = Some(config.resources.disk) {
            labels.insert("resources_disk".to_string(), disk.to_string());
        }

        let host_config = HostConfig {
            cpu_shares: Some(config.resources.cpu as i64 * DEFAULT_CPU_SHARE),
            memory: Some(config.resources.memory as i64),
            memory_swappiness: Some(0),
            shm_size: config.resources.shm.map(|v| v as i64),
            mounts: Some(mounts),
            dns: Some(vec![dns.to_string()]),
            cap_add: (!command_info.cap_add.is_empty()).then(|| command_info.cap_add.clone()),
            ..Default::default()
        };

        let create_config = Config {
            image: Some(format!("{}:{}", config.image.name, config.image.tag)),
            cmd: Some(command_info.command.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                create_config,
            )
            .await?;
        self.client
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(name)
    }

    /// Starts an `openzim/uploader` container for one file. `move_file`
    /// requests the uploader delete the source after a successful transfer.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_uploader(
        &self,
        task_id: Uuid,
        username: &str,
        host_dir: &str,
        upload_uri: &str,
        upload_dir: &str,
        filename: &str,
        move_file: bool,
        rsa_key_path: &str,
    ) -> anyhow::Result<String> {
        let name = upload_container_name(task_id, filename);
        self.remove_if_exists(&name).await;
        self.pull_image("openzim/uploader", "latest").await?;

        let container_workdir = "/data";
        let mounts = vec![
            Mount {
                target: Some(container_workdir.to_string()),
                source: Some(host_dir.to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(!move_file),
                ..Default::default()
            },
            Mount {
                target: Some(rsa_key_path.to_string()),
                source: Some(rsa_key_path.to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(true),
                ..Default::default()
            },
        ];

        let mut command = vec![
            "uploader".to_string(),
            "--file".to_string(),
            format!("{container_workdir}/{filename}"),
            "--upload-uri".to_string(),
            format!("{upload_uri}/{upload_dir}/{filename}"),
            "--username".to_string(),
            username.to_string(),
        ];
        if move_file {
            command.push("--move".to_string());
            command.push("--delete".to_string());
        }

        let mut labels = std::collections::HashMap::new();
        labels.insert("zimuploader".to_string(), "yes".to_string());
        labels.insert("task_id".to_string(), task_id.to_string());
        labels.insert("filename".to_string(), filename.to_string());

        let config = Config {
            image: Some("openzim/uploader:latest".to_string()),
            cmd: Some(command),
            env: Some(vec![format!("RSA_KEY={rsa_key_path}")]),
            labels: Some(labels),
            host_config: Some(HostConfig {
                memory_swappiness: Some(0),
                mounts: Some(mounts),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        self.client
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(name)
    }

    /// `None` if the container is gone (already reaped). `Some(status)`
    /// otherwise, one of docker's container status strings.
    pub async fn status(&self, container_name: &str) -> anyhow::Result<Option<String>> {
        match self
            .client
            .inspect_container(container_name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info.state.and_then(|s| s.status).map(|s| s.to_string())),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn is_running(&self, container_name: &str) -> anyhow::Result<bool> {
        Ok(self
            .status(container_name)
            .await?
            .map(|s| RUNNING_STATUSES.contains(&s.as_str()))
            .unwrap_or(false))
    }

    pub async fn exit_code(&self, container_name: &str) -> anyhow::Result<Option<i64>> {
        let info = self
            .client
            .inspect_container(container_name, None::<InspectContainerOptions>)
            .await?;
        Ok(info.state.and_then(|s| s.exit_code))
    }

    pub async fn stop(&self, container_name: &str, timeout_secs: i64) {
        let _ = self
            .client
            .stop_container(container_name, Some(StopContainerOptions { t: timeout_secs }))
            .await;
    }

    pub async fn remove(&self, container_name: &str) {
        self.remove_if_exists(container_name).await;
    }

    /// Best-effort: returns a message instead of failing when the container
    /// is already gone, matching the behaviour expected when reporting task
    /// failures after cleanup has already run.
    pub async fn logs(&self, container_name: &str, tail: &str) -> String {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.logs(container_name, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&log.to_string()),
                Err(_) => return format!("Container `{container_name}` gone. Can't get logs"),
            }
        }
        out
    }

    /// Sums cpu/memory/disk currently claimed by running scraper containers
    /// on this host, grounded on `query_containers_resources`: cpu and
    /// memory come from each container's live `HostConfig`, disk from the
    /// `resources_disk` label set at `start_scraper` time (docker doesn't
    /// track disk reservations itself).
    pub async fn used_resources(&self) -> anyhow::Result<ResourceSpec> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec!["zimscraper=yes".to_string()]);
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut cpu_shares = 0i64;
        let mut memory = 0i64;
        let mut disk = 0u64;
        for container in containers {
            let Some(id) = &container.id else { continue };
            let info = self
                .client
                .inspect_container(id, None::<InspectContainerOptions>)
                .await?;
            let host_config = info.host_config.unwrap_or_default();
            cpu_shares += host_config.cpu_shares.filter(|v| *v > 0).unwrap_or(DEFAULT_CPU_SHARE);
            memory += host_config.memory.unwrap_or(0);
            disk += container
                .labels
                .as_ref()
                .and_then(|labels| labels.get("resources_disk"))
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
        }

        Ok(ResourceSpec {
            cpu: (cpu_shares / DEFAULT_CPU_SHARE) as u32,
            memory: memory as u64,
            disk,
            shm: None,
        })
    }

    pub async fn log_path(&self, container_name: &str) -> anyhow::Result<String> {
        let info = self
            .client
            .inspect_container(container_name, None::<InspectContainerOptions>)
            .await?;
        info.log_path
            .ok_or_else(|| anyhow::anyhow!("container {container_name} has no LogPath"))
    }
}

/// `advertised - used`, clamped at zero per resource: what the worker's main
/// loop passes to `DispatcherClient::reserve` as its available capacity.
/// Kept as a pure helper so it can be unit tested without a docker daemon.
pub fn clamp_resources(advertised: ResourceSpec, used: ResourceSpec) -> ResourceSpec {
    ResourceSpec {
        cpu: advertised.cpu.saturating_sub(used.cpu),
        memory: advertised.memory.saturating_sub(used.memory),
        disk: advertised.disk.saturating_sub(used.disk),
        shm: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_embed_short_task_id() {
        let id = Uuid::nil();
        assert_eq!(task_container_name(id), "00000000_task");
        assert_eq!(dnscache_container_name(id), "00000000_dnscache");
        assert_eq!(scraper_container_name(id, "mwoffliner"), "00000000_scraper_mwoffliner");
    }

    #[test]
    fn upload_container_name_picks_ident_by_extension() {
        let id = Uuid::nil();
        assert_eq!(upload_container_name(id, "wikipedia.zim"), "00000000_zimup_wikipedia.zim");
        assert_eq!(upload_container_name(id, "scraper.log"), "00000000_logup_scraper.log");
    }

    #[test]
    fn clamp_resources_saturates_at_zero() {
        let advertised = ResourceSpec { cpu: 2, memory: 100, disk: 100, shm: None };
        let used = ResourceSpec { cpu: 5, memory: 10, disk: 0, shm: None };
        let clamped = clamp_resources(advertised, used);
        assert_eq!(clamped.cpu, 0);
        assert_eq!(clamped.memory, 90);
        assert_eq!(clamped.disk, 100);
    }
}
