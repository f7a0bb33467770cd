//! Docker sandbox engine. Provisions the per-stage network, volumes, and
//! host paths at setup, runs each step as a container with log capture, and
//! tears everything down at destroy without aborting on partial failures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerStateStatusEnum, DeviceMapping, EndpointSettings, HostConfig, PortBinding,
};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use stagehand_logstream::Sink;

use crate::errors::{trim_daemon_noise, EngineError, Result};
use crate::exec::SessionPool;
use crate::files::create_files;
use crate::image;
use crate::spec::{PipelineConfig, PullPolicy, RunState, Step, Volume};
use crate::Engine;

/// Grace period for soft stops; SIGTERM first, SIGKILL after.
const SOFT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine construction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Opts {
    /// Discard image pull progress instead of writing it to the step log.
    pub hide_pull: bool,
}

#[derive(Debug, Clone)]
struct TrackedContainer {
    id: String,
    soft_stop: bool,
}

/// A per-stage Docker engine. Holds the daemon client, the pipeline config
/// captured at setup, and every container it has created.
pub struct DockerEngine {
    client: Docker,
    hide_pull: bool,
    containers: Mutex<Vec<TrackedContainer>>,
    config: Mutex<Option<PipelineConfig>>,
    sessions: SessionPool,
}

impl DockerEngine {
    /// Connects to the host daemon over the platform default transport.
    pub fn connect(opts: Opts) -> Result<Self> {
        #[cfg(unix)]
        let client = Docker::connect_with_socket_defaults()?;
        #[cfg(windows)]
        let client = Docker::connect_with_named_pipe_defaults()?;

        Ok(Self::with_client(client, opts))
    }

    pub fn with_client(client: Docker, opts: Opts) -> Self {
        Self {
            client,
            hide_pull: opts.hide_pull,
            containers: Mutex::new(Vec::new()),
            config: Mutex::new(None),
            sessions: SessionPool::new(),
        }
    }

    async fn pull_image(
        &self,
        image_ref: &str,
        creds: Option<DockerCredentials>,
        output: &Arc<dyn Sink>,
    ) -> Result<()> {
        debug!(image = image_ref, "pulling image");
        let options = CreateImageOptions {
            from_image: image_ref.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, creds);
        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if self.hide_pull {
                        continue;
                    }
                    if let Some(status) = info.status {
                        let mut line = status;
                        if let Some(progress) = info.progress {
                            line.push(' ');
                            line.push_str(&progress);
                        }
                        line.push('\n');
                        output.write(line.as_bytes());
                    }
                }
                Err(err) => {
                    return Err(EngineError::Pull(trim_daemon_noise(&err.to_string())));
                }
            }
        }
        Ok(())
    }

    async fn create(&self, step: &Step, output: &Arc<dyn Sink>) -> Result<()> {
        let pipeline = self
            .config
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default();

        let creds = step.auth.as_ref().map(|auth| DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            serveraddress: (!auth.address.is_empty()).then(|| auth.address.clone()),
            ..Default::default()
        });

        // pull up front when requested, or when the tag is floating
        if step.pull == PullPolicy::Always
            || (step.pull == PullPolicy::Default && image::is_latest(&step.image))
        {
            self.pull_image(&step.image, creds.clone(), output).await?;
        }

        let options = CreateContainerOptions {
            name: step.id.clone(),
            platform: None,
        };
        let result = self
            .client
            .create_container(Some(options.clone()), container_config(&pipeline, step))
            .await;

        if let Err(err) = result {
            let err = EngineError::from(err);
            // the image may simply be absent locally; pull once and retry
            if !err.is_not_found() || step.pull == PullPolicy::Never {
                return Err(err);
            }
            self.pull_image(&step.image, creds, output).await?;
            self.client
                .create_container(Some(options), container_config(&pipeline, step))
                .await?;
        }

        self.containers.lock().unwrap().push(TrackedContainer {
            id: step.id.clone(),
            soft_stop: step.soft_stop,
        });

        // attach global user-defined networks when no primary override is set
        if step.network.is_empty() {
            for net in &step.networks {
                let attach = ConnectNetworkOptions {
                    container: step.id.clone(),
                    endpoint_config: EndpointSettings {
                        aliases: Some(vec![net.clone()]),
                        ..Default::default()
                    },
                };
                if let Err(err) = self.client.connect_network(net, attach).await {
                    warn!(container = %step.id, network = %net, error = %err,
                        "could not attach container to network");
                }
            }
        }

        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Follows the container log stream on a background task, demultiplexing
    /// stdout/stderr into the step sink until the container stops.
    fn tail(&self, id: &str, output: Arc<dyn Sink>, cancel: CancellationToken) {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let client = self.client.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let mut logs = client.logs(&id, Some(options));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = logs.next() => match item {
                        Some(Ok(chunk)) => match chunk {
                            LogOutput::StdOut { message }
                            | LogOutput::StdErr { message }
                            | LogOutput::Console { message } => output.write(&message),
                            LogOutput::StdIn { .. } => {}
                        },
                        Some(Err(err)) => {
                            warn!(container = %id, error = %err, "failed to tail container logs");
                            break;
                        }
                        None => break,
                    }
                }
            }
        });
    }

    async fn wait(&self, id: &str, cancel: &CancellationToken) -> Result<RunState> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut waits = self.client.wait_container(id, Some(options));
        tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Canceled),
            // either a wait response or a transport error; inspect decides
            _ = waits.next() => {}
        }

        let inspect = self.client.inspect_container(id, None).await?;
        let state = inspect.state.unwrap_or_default();
        Ok(RunState {
            exited: !state.running.unwrap_or(false),
            exit_code: state.exit_code.unwrap_or(0),
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    /// The daemon occasionally reports a wait completion while the container
    /// is still running; loop until the state is terminal or the caller
    /// cancels.
    async fn wait_retry(&self, id: &str, cancel: &CancellationToken) -> Result<RunState> {
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Canceled);
            }
            let state = self.wait(id, cancel).await?;
            if state.exited {
                return Ok(state);
            }
            trace!(container = id, "docker wait exited unexpectedly");
        }
    }

    async fn soft_stop(&self, id: &str) {
        info!(container = id, "starting soft stop");
        let options = StopContainerOptions {
            t: SOFT_STOP_TIMEOUT.as_secs() as i64,
        };
        if let Err(err) = self.client.stop_container(id, Some(options)).await {
            warn!(container = id, error = %err, "failed to stop container");
        }

        // give the container the grace period to reach a removable state
        let deadline = tokio::time::Instant::now() + SOFT_STOP_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let status = match self.client.inspect_container(id, None).await {
                Ok(inspect) => inspect.state.and_then(|s| s.status),
                Err(err) => {
                    warn!(container = id, error = %err, "failed to inspect container");
                    continue;
                }
            };
            match status {
                Some(ContainerStateStatusEnum::RUNNING)
                | Some(ContainerStateStatusEnum::REMOVING) => continue,
                _ => break,
            }
        }
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn setup(&self, config: &PipelineConfig) -> Result<()> {
        // capture the config first so a failed setup can still be destroyed
        *self.config.lock().unwrap() = Some(config.clone());

        for vol in config.volumes.iter().filter_map(Volume::as_empty_dir) {
            let options = CreateVolumeOptions {
                name: vol.id.clone(),
                driver: "local".to_string(),
                driver_opts: HashMap::new(),
                labels: vol.labels.clone(),
            };
            self.client.create_volume(options).await?;
        }

        for vol in config.volumes.iter().filter_map(Volume::as_host_path) {
            if !vol.create {
                continue;
            }
            if let Err(err) = std::fs::create_dir_all(&vol.path) {
                warn!(path = %vol.path, error = %err, "cannot create workspace on host");
                return Err(err.into());
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&vol.path, std::fs::Permissions::from_mode(0o777))?;
            }
        }

        create_files(&config.files)?;

        let mut driver = if config.platform.os == "windows" {
            "nat"
        } else {
            "bridge"
        };
        if !config.network_driver.is_empty() {
            driver = &config.network_driver;
        }
        let options = CreateNetworkOptions {
            name: config.network.id.clone(),
            driver: driver.to_string(),
            options: config.network.options.clone(),
            labels: config.network.labels.clone(),
            ..Default::default()
        };
        self.client.create_network(options).await?;
        Ok(())
    }

    async fn run(
        &self,
        step: &Step,
        output: Arc<dyn Sink>,
        cancel: CancellationToken,
    ) -> Result<RunState> {
        // steps without an image execute directly on the host
        if step.image.is_empty() {
            return self.sessions.run(step, output).await;
        }

        trace!(step_id = %step.id, "creating the container");
        self.create(step, &output).await?;
        trace!(step_id = %step.id, "starting the container");
        self.start(&step.id).await?;
        trace!(step_id = %step.id, "tailing the container");
        self.tail(&step.id, output, cancel.clone());
        self.wait_retry(&step.id, &cancel).await
    }

    async fn destroy(&self) -> Result<()> {
        let containers = self.containers.lock().unwrap().clone();

        for ctr in &containers {
            if ctr.soft_stop {
                self.soft_stop(&ctr.id).await;
            } else {
                let options = KillContainerOptions { signal: "SIGKILL" };
                if let Err(err) = self.client.kill_container(&ctr.id, Some(options)).await {
                    warn!(container = %ctr.id, error = %err, "failed to kill container");
                }
            }
        }

        for ctr in &containers {
            let options = RemoveContainerOptions {
                force: true,
                link: false,
                v: true,
            };
            if let Err(err) = self.client.remove_container(&ctr.id, Some(options)).await {
                warn!(container = %ctr.id, error = %err, "failed to remove container");
            }
        }

        let config = self.config.lock().unwrap().clone();
        if let Some(config) = config {
            for vol in config.volumes.iter().filter_map(Volume::as_empty_dir) {
                // tmpfs volumes have no backing volume object
                if vol.medium == "memory" {
                    continue;
                }
                let options = RemoveVolumeOptions { force: true };
                if let Err(err) = self.client.remove_volume(&vol.id, Some(options)).await {
                    warn!(volume = %vol.id, error = %err, "failed to remove volume");
                }
            }

            for file in &config.files {
                if let Err(err) = std::fs::remove_file(&file.path) {
                    warn!(file = %file.path, error = %err, "could not delete created file");
                }
            }

            for vol in config.volumes.iter().filter_map(Volume::as_host_path) {
                if !vol.remove {
                    continue;
                }
                info!(path = %vol.path, "removing temporary workspace from host");
                if let Err(err) = std::fs::remove_dir_all(&vol.path) {
                    warn!(path = %vol.path, error = %err, "could not remove temporary workspace");
                }
            }

            if let Err(err) = self.client.remove_network(&config.network.id).await {
                warn!(network = %config.network.id, error = %err, "failed to remove network");
            }
        }

        // cleanup failures are logged and swallowed; a second destroy finds
        // nothing and still succeeds
        self.containers.lock().unwrap().clear();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.client.ping().await?;
        Ok(())
    }

    async fn debug(&self, step_id: &str, command: &str, last: bool) -> Result<()> {
        self.sessions.debug(step_id, command, last).await
    }
}

fn lookup_volume<'a>(pipeline: &'a PipelineConfig, name: &str) -> Option<&'a Volume> {
    pipeline.volumes.iter().find(|v| v.name() == name)
}

fn volume_binds(pipeline: &PipelineConfig, step: &Step) -> Vec<String> {
    let mut binds = Vec::new();
    for mount in &step.volumes {
        match lookup_volume(pipeline, &mount.name) {
            Some(Volume::EmptyDir(vol)) => {
                binds.push(format!("{}:{}", vol.id, mount.path));
            }
            Some(Volume::HostPath(vol)) => {
                let mut bind = format!("{}:{}", vol.path, mount.path);
                if vol.read_only {
                    bind.push_str(":ro");
                }
                binds.push(bind);
            }
            None => {
                warn!(step_id = %step.id, volume = %mount.name, "step references unknown volume");
            }
        }
    }
    binds
}

fn container_config(pipeline: &PipelineConfig, step: &Step) -> Config<String> {
    let mut envs = pipeline.envs.clone();
    envs.extend(step.envs.clone());
    // empty values are dropped rather than exported as empty strings
    let env: Vec<String> = envs
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    let mut exposed_ports = HashMap::new();
    for container_port in step.port_bindings.values() {
        let key = if container_port.contains('/') {
            container_port.clone()
        } else {
            format!("{container_port}/tcp")
        };
        exposed_ports.insert(key, HashMap::new());
    }

    Config {
        image: Some(step.image.clone()),
        entrypoint: (!step.entrypoint.is_empty()).then(|| step.entrypoint.clone()),
        cmd: (!step.command.is_empty()).then(|| step.command.clone()),
        env: Some(env),
        labels: Some(step.labels.clone()),
        working_dir: (!step.working_dir.is_empty()).then(|| step.working_dir.clone()),
        user: (!step.user.is_empty()).then(|| step.user.clone()),
        attach_stdout: Some(!step.ignore_stdout),
        attach_stderr: Some(!step.ignore_stderr),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config(pipeline, step)),
        networking_config: net_config(pipeline, step),
        ..Default::default()
    }
}

fn host_config(pipeline: &PipelineConfig, step: &Step) -> HostConfig {
    let binds = volume_binds(pipeline, step);

    let devices: Vec<DeviceMapping> = step
        .devices
        .iter()
        .filter_map(|device| {
            let host_path = match lookup_volume(pipeline, &device.name) {
                Some(Volume::HostPath(vol)) => vol.path.clone(),
                _ => return None,
            };
            Some(DeviceMapping {
                path_on_host: Some(host_path),
                path_in_container: Some(device.device_path.clone()),
                cgroup_permissions: Some("rwm".to_string()),
            })
        })
        .collect();

    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for (host_port, container_port) in &step.port_bindings {
        let key = if container_port.contains('/') {
            container_port.clone()
        } else {
            format!("{container_port}/tcp")
        };
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.clone()),
            }]),
        );
    }

    HostConfig {
        binds: (!binds.is_empty()).then_some(binds),
        devices: (!devices.is_empty()).then_some(devices),
        dns: (!step.dns.is_empty()).then(|| step.dns.clone()),
        dns_search: (!step.dns_search.is_empty()).then(|| step.dns_search.clone()),
        extra_hosts: (!step.extra_hosts.is_empty()).then(|| step.extra_hosts.clone()),
        privileged: Some(step.privileged),
        shm_size: (step.shm_size != 0).then_some(step.shm_size),
        memory: (step.mem_limit != 0).then_some(step.mem_limit),
        memory_swap: (step.memswap_limit != 0).then_some(step.memswap_limit),
        cpu_period: (step.cpu_period != 0).then_some(step.cpu_period),
        cpu_quota: (step.cpu_quota != 0).then_some(step.cpu_quota),
        cpu_shares: (step.cpu_shares != 0).then_some(step.cpu_shares),
        cpuset_cpus: (!step.cpu_set.is_empty()).then(|| step.cpu_set.join(",")),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        ..Default::default()
    }
}

fn net_config(pipeline: &PipelineConfig, step: &Step) -> Option<NetworkingConfig<String>> {
    // an explicit step network wins over the stage network; containers on
    // the stage network are aliased by step name for DNS between steps
    let (network, aliases) = if !step.network.is_empty() {
        (step.network.clone(), None)
    } else if !pipeline.network.id.is_empty() {
        let aliases = (!step.name.is_empty()).then(|| vec![step.name.clone()]);
        (pipeline.network.id.clone(), aliases)
    } else {
        return None;
    };

    let mut endpoints = HashMap::new();
    endpoints.insert(
        network,
        EndpointSettings {
            aliases,
            ..Default::default()
        },
    );
    Some(NetworkingConfig {
        endpoints_config: endpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{EmptyDirVolume, HostPathVolume, VolumeMount};

    fn pipeline() -> PipelineConfig {
        PipelineConfig {
            network: crate::spec::Network {
                id: "n1".to_string(),
                ..Default::default()
            },
            volumes: vec![
                Volume::HostPath(HostPathVolume {
                    name: "harness".to_string(),
                    path: "/tmp/ws-abc".to_string(),
                    ..Default::default()
                }),
                Volume::EmptyDir(EmptyDirVolume {
                    id: "cache-0".to_string(),
                    name: "cache".to_string(),
                    ..Default::default()
                }),
            ],
            ..Default::default()
        }
    }

    fn step() -> Step {
        Step {
            id: "st1".to_string(),
            name: "build".to_string(),
            image: "alpine:3".to_string(),
            volumes: vec![
                VolumeMount {
                    name: "harness".to_string(),
                    path: "/workspace".to_string(),
                },
                VolumeMount {
                    name: "cache".to_string(),
                    path: "/cache".to_string(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn binds_resolve_through_pipeline_volumes() {
        let binds = volume_binds(&pipeline(), &step());
        assert_eq!(binds, vec!["/tmp/ws-abc:/workspace", "cache-0:/cache"]);
    }

    #[test]
    fn readonly_host_paths_get_ro_suffix() {
        let mut p = pipeline();
        if let Volume::HostPath(hp) = &mut p.volumes[0] {
            hp.read_only = true;
        }
        let binds = volume_binds(&p, &step());
        assert_eq!(binds[0], "/tmp/ws-abc:/workspace:ro");
    }

    #[test]
    fn empty_env_values_are_dropped() {
        let mut s = step();
        s.envs.insert("KEEP".to_string(), "1".to_string());
        s.envs.insert("DROP".to_string(), String::new());
        let config = container_config(&pipeline(), &s);
        let env = config.env.unwrap();
        assert!(env.contains(&"KEEP=1".to_string()));
        assert!(!env.iter().any(|e| e.starts_with("DROP=")));
    }

    #[test]
    fn primary_network_carries_step_alias() {
        let config = net_config(&pipeline(), &step()).unwrap();
        let endpoint = config.endpoints_config.get("n1").unwrap();
        assert_eq!(endpoint.aliases.as_ref().unwrap(), &vec!["build".to_string()]);
    }

    #[test]
    fn explicit_step_network_wins() {
        let mut s = step();
        s.network = "custom".to_string();
        let config = net_config(&pipeline(), &s).unwrap();
        assert!(config.endpoints_config.contains_key("custom"));
        assert!(!config.endpoints_config.contains_key("n1"));
    }

    #[test]
    fn resource_caps_map_to_host_config() {
        let mut s = step();
        s.mem_limit = 1048576;
        s.cpu_quota = 50000;
        s.cpu_set = vec!["0".to_string(), "1".to_string()];
        s.port_bindings
            .insert("8080".to_string(), "80".to_string());
        let hc = host_config(&pipeline(), &s);
        assert_eq!(hc.memory, Some(1048576));
        assert_eq!(hc.cpu_quota, Some(50000));
        assert_eq!(hc.cpuset_cpus.as_deref(), Some("0,1"));
        let bindings = hc.port_bindings.unwrap();
        let binding = bindings.get("80/tcp").unwrap().as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8080"));
    }
}
