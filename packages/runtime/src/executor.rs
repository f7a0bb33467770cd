//! Per-stage step executor: installs steps, runs them against the sandbox
//! engine on background tasks, and publishes terminal results to long-poll
//! waiters. Steps within one stage are not serialized; concurrent starts
//! run in parallel against the shared sandbox.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stagehand_engine::files::create_files;
use stagehand_engine::spec::{File, Step, Volume, VolumeMount};
use stagehand_engine::{
    trim_daemon_noise, Engine, DOCKER_SOCK_UNIX_PATH, DOCKER_SOCK_VOLUME_NAME,
    DOCKER_SOCK_WIN_PATH,
};
use stagehand_logstream::{nudge, LiveLog, Sink};
use stagehand_ti::report;

use crate::api::{
    OutputType, OutputV2, PollStepRequest, PollStepResponse, StartStepRequest, StepKind,
    StreamOutputRequest,
};
use crate::output;
use crate::pipeline::{PipelineState, SHARED_VOL_PATH};
use crate::shellcmd;

const PLUGIN_OUTPUT_SECRETS_FLAG: &str = "CI_ENABLE_PLUGIN_OUTPUT_SECRETS";

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("step id is not specified")]
    MissingId,

    #[error("step {0} already exists")]
    AlreadyExists(String),

    #[error("step {0} does not exist")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("step task terminated without a result")]
    Abandoned,
}

enum StepStatus {
    Queued,
    Running,
    Done(PollStepResponse),
}

struct StepEntry {
    status: Mutex<StepStatus>,
    done: watch::Sender<bool>,
    log: Arc<LiveLog>,
}

/// Inputs the completion task needs beyond the assembled step.
struct StepParams {
    kind: StepKind,
    outputs: Vec<OutputV2>,
    wants_outputs: bool,
    test_report: stagehand_ti::TestReport,
    working_dir: String,
    plugin_secrets: bool,
    output_file: String,
    secrets_file: Option<String>,
    artifact_file: String,
}

pub struct StepExecutor {
    engine: Arc<dyn Engine>,
    state: Arc<PipelineState>,
    steps: Mutex<HashMap<String, Arc<StepEntry>>>,
}

impl StepExecutor {
    pub fn new(engine: Arc<dyn Engine>, state: Arc<PipelineState>) -> Self {
        Self {
            engine,
            state,
            steps: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_step(&self, id: &str) -> bool {
        self.steps.lock().unwrap().contains_key(id)
    }

    /// Installs the step and returns once its run task is spawned. Errors
    /// are produced only for early validation failures.
    pub async fn start_step(&self, req: StartStepRequest) -> Result<(), ExecutorError> {
        let mut cfg = req.config;
        if cfg.id.is_empty() {
            return Err(ExecutorError::MissingId);
        }
        if self.has_step(&cfg.id) {
            return Err(ExecutorError::AlreadyExists(cfg.id));
        }

        self.state.append_secrets(&cfg.secrets);

        // the docker socket rides along unless explicitly disabled
        if cfg.mount_docker_socket.unwrap_or(true) {
            cfg.volumes.push(docker_sock_mount());
        }

        let volumes = self.state.volumes();

        // stage-level host paths with a container path (the shared volume,
        // global CI mounts, the workspace) ride along with every step
        for vol in volumes.iter().filter_map(Volume::as_host_path) {
            if vol.container_path.is_empty() || vol.name == DOCKER_SOCK_VOLUME_NAME {
                continue;
            }
            if !cfg.volumes.iter().any(|m| m.name == vol.name) {
                cfg.volumes.push(VolumeMount {
                    name: vol.name.clone(),
                    path: vol.container_path.clone(),
                });
            }
        }

        // re-point the step at the per-stage clone workspace
        if let Some(harness) = volumes
            .iter()
            .filter_map(Volume::as_host_path)
            .find(|v| v.name == "harness")
        {
            cfg.working_dir = harness.path.clone();
            for mount in &mut cfg.volumes {
                if mount.name == "harness" {
                    mount.path = harness.path.clone();
                }
            }
            if is_clone_image(&cfg.image) {
                massage_clone_workspace(&mut cfg.envs, &harness.path);
            }
        }

        let (entrypoint, mut command) = match cfg.kind {
            StepKind::Run | StepKind::Background => {
                (cfg.run.entrypoint.clone(), cfg.run.command.clone())
            }
            StepKind::RunTest | StepKind::RunTestsV2 => {
                let rt = &cfg.run_test;
                let mut script = String::new();
                if !rt.pre_command.is_empty() {
                    script.push_str(&rt.pre_command);
                    script.push('\n');
                }
                script.push_str(&rt.args);
                if !rt.post_command.is_empty() {
                    script.push('\n');
                    script.push_str(&rt.post_command);
                }
                (rt.entrypoint.clone(), vec![script])
            }
        };

        let wants_outputs = !cfg.output_vars.is_empty() || !cfg.outputs.is_empty();
        if wants_outputs && (entrypoint.is_empty() || command.is_empty()) {
            return Err(ExecutorError::InvalidConfig(
                "output variable should not be set for unset entrypoint or command".to_string(),
            ));
        }

        let plugin_secrets = flag_enabled(&cfg.envs, PLUGIN_OUTPUT_SECRETS_FLAG);
        let output_file = if plugin_secrets {
            format!("{SHARED_VOL_PATH}/{}-output.env", cfg.id)
        } else {
            format!("{SHARED_VOL_PATH}/{}.out", cfg.id)
        };
        let secrets_file =
            plugin_secrets.then(|| format!("{SHARED_VOL_PATH}/{}-output-secrets.env", cfg.id));
        let artifact_file = format!("{SHARED_VOL_PATH}/{}-artifact", cfg.id);

        let mut envs = cfg.envs.clone();
        envs.insert("DRONE_OUTPUT".to_string(), output_file.clone());
        if let Some(file) = &secrets_file {
            envs.insert("HARNESS_OUTPUT_SECRET_FILE".to_string(), file.clone());
        }
        envs.insert("PLUGIN_ARTIFACT_FILE".to_string(), artifact_file.clone());

        // the step's own shell emits the named outputs into the output file
        if wants_outputs {
            let pairs: Vec<(String, String)> = if !cfg.outputs.is_empty() {
                cfg.outputs
                    .iter()
                    .map(|o| (o.key.clone(), o.value.clone()))
                    .collect()
            } else {
                cfg.output_vars
                    .iter()
                    .map(|v| (v.clone(), v.clone()))
                    .collect()
            };
            command[0].push_str(&shellcmd::export_commands(
                &entrypoint,
                &pairs,
                &output_file,
                plugin_secrets,
            ));
        }

        let mut files = cfg.files.clone();
        if wants_outputs {
            files.push(File {
                path: output_file.clone(),
                mode: 0o777,
                is_dir: false,
                data: String::new(),
            });
        }

        let step = Step {
            id: cfg.id.clone(),
            name: if cfg.name.is_empty() {
                cfg.id.clone()
            } else {
                cfg.name.clone()
            },
            image: cfg.image.clone(),
            entrypoint,
            command,
            envs,
            secrets: cfg.secrets.clone(),
            working_dir: cfg.working_dir.clone(),
            user: cfg.user.clone(),
            volumes: cfg.volumes.clone(),
            devices: cfg.devices.clone(),
            labels: cfg.labels.clone(),
            files,
            dns: cfg.dns.clone(),
            dns_search: cfg.dns_search.clone(),
            extra_hosts: cfg.extra_hosts.clone(),
            privileged: cfg.privileged,
            port_bindings: cfg.port_bindings.clone(),
            cpu_period: cfg.cpu_period,
            cpu_quota: cfg.cpu_quota,
            cpu_shares: cfg.cpu_shares,
            cpu_set: cfg.cpu_set.clone(),
            mem_limit: cfg.mem_limit,
            memswap_limit: cfg.memswap_limit,
            shm_size: cfg.shm_size,
            network: cfg.network.clone(),
            networks: cfg.networks.clone(),
            pull: cfg.pull,
            auth: cfg.auth.clone(),
            soft_stop: cfg.soft_stop,
            detach: cfg.detach,
            ignore_stdout: cfg.ignore_stdout,
            ignore_stderr: cfg.ignore_stderr,
        };

        let log_key = if cfg.log_key.is_empty() {
            cfg.id.clone()
        } else {
            cfg.log_key.clone()
        };
        let log = LiveLog::new(
            self.state.log_client(),
            log_key,
            self.state.secrets(),
            self.state.indirect_upload(),
        );

        let (done, _) = watch::channel(false);
        let entry = Arc::new(StepEntry {
            status: Mutex::new(StepStatus::Queued),
            done,
            log,
        });
        {
            let mut steps = self.steps.lock().unwrap();
            if steps.contains_key(&cfg.id) {
                return Err(ExecutorError::AlreadyExists(cfg.id));
            }
            steps.insert(cfg.id.clone(), entry.clone());
        }

        // the run owns its cancellation; the step timeout is the only
        // trigger so client disconnects never abort a running step
        let cancel = CancellationToken::new();
        if cfg.timeout > 0 {
            let timer = cancel.clone();
            let timeout = Duration::from_secs(cfg.timeout as u64);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timer.cancel();
            });
        }

        let params = StepParams {
            kind: cfg.kind,
            outputs: cfg.outputs.clone(),
            wants_outputs,
            test_report: cfg.test_report.clone(),
            working_dir: cfg.working_dir.clone(),
            plugin_secrets,
            output_file,
            secrets_file,
            artifact_file,
        };

        let engine = self.engine.clone();
        let state = self.state.clone();
        tokio::spawn(run_and_complete(engine, state, entry, step, params, cancel));
        Ok(())
    }

    /// Blocks until the step reaches a terminal state. Long-poll: the only
    /// timeout is the caller's.
    pub async fn poll_step(
        &self,
        req: &PollStepRequest,
    ) -> Result<PollStepResponse, ExecutorError> {
        let entry = self
            .steps
            .lock()
            .unwrap()
            .get(&req.id)
            .cloned()
            .ok_or_else(|| ExecutorError::NotFound(req.id.clone()))?;

        let mut done = entry.done.subscribe();
        loop {
            if let StepStatus::Done(resp) = &*entry.status.lock().unwrap() {
                return Ok(resp.clone());
            }
            if done.changed().await.is_err() {
                return Err(ExecutorError::Abandoned);
            }
        }
    }

    /// Returns captured output from `offset` plus a live stream of new data
    /// until the step completes.
    pub fn stream_output(
        &self,
        req: &StreamOutputRequest,
    ) -> Result<(Vec<u8>, mpsc::UnboundedReceiver<Vec<u8>>), ExecutorError> {
        let entry = self
            .steps
            .lock()
            .unwrap()
            .get(&req.id)
            .cloned()
            .ok_or_else(|| ExecutorError::NotFound(req.id.clone()))?;
        Ok(entry.log.tail(req.offset))
    }
}

async fn run_and_complete(
    engine: Arc<dyn Engine>,
    state: Arc<PipelineState>,
    entry: Arc<StepEntry>,
    step: Step,
    params: StepParams,
    cancel: CancellationToken,
) {
    *entry.status.lock().unwrap() = StepStatus::Running;

    if let Err(err) = create_files(&step.files) {
        warn!(step_id = %step.id, error = %err, "could not materialize step files");
        finish(
            &entry,
            PollStepResponse {
                error: err.to_string(),
                ..Default::default()
            },
        )
        .await;
        return;
    }

    info!(step_id = %step.id, "starting step run");
    let started = std::time::Instant::now();
    let sink: Arc<dyn Sink> = entry.log.clone();
    let result = engine.run(&step, sink, cancel).await;
    let elapsed_ms = started.elapsed().as_millis() as i64;
    debug!(step_id = %step.id, elapsed_ms, "completed step run");

    let response = complete(&state, &entry.log, &step, &params, result, elapsed_ms).await;
    finish(&entry, response).await;
}

async fn finish(entry: &StepEntry, response: PollStepResponse) {
    // flush and close the sink before waking waiters so file-backed logs
    // are complete when the caller fetches them
    entry.log.close().await;
    *entry.status.lock().unwrap() = StepStatus::Done(response);
    let _ = entry.done.send(true);
}

async fn complete(
    state: &PipelineState,
    log: &LiveLog,
    step: &Step,
    params: &StepParams,
    result: stagehand_engine::Result<stagehand_engine::spec::RunState>,
    elapsed_ms: i64,
) -> PollStepResponse {
    let mut resp = PollStepResponse::default();

    // report ingestion is best-effort: failures are logged, never fatal
    let mut test_report = params.test_report.clone();
    if params.kind == StepKind::RunTestsV2 && test_report.junit.paths.is_empty() {
        test_report.junit.paths = vec!["**/*.xml".to_string()];
    }
    if !test_report.junit.paths.is_empty() {
        let client = state.ti_client();
        match report::parse_and_upload(&test_report, &params.working_dir, &step.id, client.as_ref())
            .await
        {
            Ok(0) => {}
            Ok(count) => debug!(step_id = %step.id, count, "uploaded test report"),
            Err(err) => warn!(step_id = %step.id, error = %err, "failed to upload report"),
        }
    }
    if params.kind == StepKind::RunTestsV2 {
        let ti_config = state.ti_config();
        if !ti_config.url.is_empty() {
            let client = state.ti_client();
            if let Err(err) =
                report::upload_callgraph(&ti_config, &step.id, elapsed_ms, client.as_ref()).await
            {
                warn!(step_id = %step.id, error = %err, "unable to collect callgraph");
            }
        }
    }

    if let Ok(bytes) = std::fs::read(&params.artifact_file) {
        resp.artifact = Some(bytes);
    }

    let run_state = match result {
        Ok(run_state) => run_state,
        Err(err) => {
            resp.error = trim_daemon_noise(&err.to_string());
            return resp;
        }
    };
    resp.exited = run_state.exited;
    resp.exit_code = run_state.exit_code;
    resp.oom_killed = run_state.oom_killed;

    if run_state.exited && run_state.exit_code == 0 {
        let parsed = if params.plugin_secrets {
            output::parse_env_file(&params.output_file)
        } else {
            output::parse_output_file(&params.output_file, output::DELIMITER_SPACE)
        };
        match parsed {
            Ok(outputs) => {
                if !params.outputs.is_empty() {
                    for declared in &params.outputs {
                        if let Some(value) = outputs.get(&declared.key) {
                            resp.output_v2.push(OutputV2 {
                                key: declared.key.clone(),
                                value: value.clone(),
                                kind: declared.kind,
                            });
                        }
                    }
                } else if params.wants_outputs {
                    for (key, value) in &outputs {
                        resp.output_v2.push(OutputV2 {
                            key: key.clone(),
                            value: value.clone(),
                            kind: OutputType::String,
                        });
                    }
                }
                resp.outputs = outputs;
                remove_quiet(&params.output_file);

                if let Some(secrets_file) = &params.secrets_file {
                    if Path::new(secrets_file).exists() {
                        match output::parse_env_file(secrets_file) {
                            Ok(secrets) => {
                                for (key, value) in secrets {
                                    resp.output_v2.push(OutputV2 {
                                        key,
                                        value,
                                        kind: OutputType::Secret,
                                    });
                                }
                            }
                            Err(err) => {
                                warn!(step_id = %step.id, error = %err,
                                    "could not read plugin output secrets");
                            }
                        }
                        remove_quiet(secrets_file);
                    }
                }
            }
            Err(err) => {
                if params.wants_outputs {
                    resp.error = err.to_string();
                }
            }
        }
    } else {
        let snapshot = log.snapshot();
        if let Some(classified) = nudge::classify(&snapshot, &nudge::default_nudges()) {
            resp.error = classified;
        } else if resp.oom_killed {
            resp.error = "out of memory".to_string();
        }
    }

    resp
}

fn remove_quiet(path: &str) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(file = path, error = %err, "could not remove output file");
        }
    }
}

fn flag_enabled(envs: &HashMap<String, String>, name: &str) -> bool {
    envs.get(name).map(String::as_str) == Some("true")
}

fn docker_sock_mount() -> VolumeMount {
    let path = if cfg!(windows) {
        DOCKER_SOCK_WIN_PATH
    } else {
        DOCKER_SOCK_UNIX_PATH
    };
    VolumeMount {
        name: DOCKER_SOCK_VOLUME_NAME.to_string(),
        path: path.to_string(),
    }
}

fn is_clone_image(image: &str) -> bool {
    let name = match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => name,
        _ => image,
    };
    name.ends_with("drone/git") || name.ends_with("drone-git")
}

/// The clone step resolves its checkout dir from `DRONE_WORKSPACE`; anchor
/// it under the per-stage workspace so concurrent stages cannot collide.
fn massage_clone_workspace(envs: &mut HashMap<String, String>, workspace: &str) {
    let current = envs.get("DRONE_WORKSPACE").cloned().unwrap_or_default();
    if !current.is_empty() && current.starts_with(workspace) {
        return;
    }
    let rel = current.trim_start_matches('/');
    let value = if rel.is_empty() {
        workspace.to_string()
    } else {
        format!("{}/{}", workspace.trim_end_matches('/'), rel)
    };
    envs.insert("DRONE_WORKSPACE".to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{RunConfig, StartStepRequestConfig};
    use crate::test_support::FakeEngine;

    fn executor(engine: FakeEngine) -> StepExecutor {
        let state = Arc::new(PipelineState::new());
        StepExecutor::new(Arc::new(engine), state)
    }

    fn run_request(id: &str) -> StartStepRequest {
        StartStepRequest {
            stage_runtime_id: "S1".to_string(),
            config: StartStepRequestConfig {
                id: id.to_string(),
                image: "alpine:3".to_string(),
                run: RunConfig {
                    entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
                    command: vec!["echo hi".to_string()],
                },
                mount_docker_socket: Some(false),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn happy_path_returns_exit_state() {
        let ex = executor(FakeEngine::succeeding());
        ex.start_step(run_request("exec-ok")).await.unwrap();

        let resp = ex
            .poll_step(&PollStepRequest {
                id: "exec-ok".to_string(),
            })
            .await
            .unwrap();
        assert!(resp.exited);
        assert_eq!(resp.exit_code, 0);
        assert!(resp.error.is_empty());
    }

    #[tokio::test]
    async fn output_vars_are_extracted_and_projected() {
        let engine = FakeEngine::succeeding().with_output_file("K 42\n");
        let ex = executor(engine);

        let mut req = run_request("exec-outputs");
        req.config.output_vars = vec!["K".to_string()];
        ex.start_step(req).await.unwrap();

        let resp = ex
            .poll_step(&PollStepRequest {
                id: "exec-outputs".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(resp.outputs.get("K").unwrap(), "42");
        assert_eq!(resp.output_v2.len(), 1);
        assert_eq!(resp.output_v2[0].key, "K");
        assert_eq!(resp.output_v2[0].kind, OutputType::String);
        // at-most-once delivery: the file is gone after the read
        assert!(!Path::new(&format!("{SHARED_VOL_PATH}/exec-outputs.out")).exists());
    }

    #[tokio::test]
    async fn output_suffix_is_appended_to_the_command() {
        let engine = FakeEngine::succeeding();
        let seen = engine.steps();
        let ex = executor(engine);

        let mut req = run_request("exec-suffix");
        req.config.output_vars = vec!["K".to_string()];
        ex.start_step(req).await.unwrap();
        ex.poll_step(&PollStepRequest {
            id: "exec-suffix".to_string(),
        })
        .await
        .unwrap();

        let steps = seen.lock().unwrap();
        let command = &steps[0].command[0];
        assert!(command.starts_with("echo hi"));
        assert!(command.contains("echo \"K $K\" >> /tmp/engine/exec-suffix.out"));
        assert_eq!(
            steps[0].envs.get("DRONE_OUTPUT").unwrap(),
            "/tmp/engine/exec-suffix.out"
        );
    }

    #[tokio::test]
    async fn output_vars_without_command_are_rejected() {
        let ex = executor(FakeEngine::succeeding());
        let mut req = run_request("exec-invalid");
        req.config.run.command.clear();
        req.config.output_vars = vec!["K".to_string()];

        let err = ex.start_step(req).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn failed_steps_are_classified_by_nudges() {
        let engine = FakeEngine::failing(137).with_log("processing...\nKilled\n");
        let ex = executor(engine);
        ex.start_step(run_request("exec-oom")).await.unwrap();

        let resp = ex
            .poll_step(&PollStepRequest {
                id: "exec-oom".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(resp.exit_code, 137);
        assert!(resp.error.contains("out of memory"));
    }

    #[tokio::test]
    async fn poll_on_unknown_step_fails() {
        let ex = executor(FakeEngine::succeeding());
        let err = ex
            .poll_step(&PollStepRequest {
                id: "ghost".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound(_)));
    }

    #[tokio::test]
    async fn poll_on_terminal_step_returns_immediately() {
        let ex = executor(FakeEngine::succeeding());
        ex.start_step(run_request("exec-twice")).await.unwrap();

        let req = PollStepRequest {
            id: "exec-twice".to_string(),
        };
        let first = ex.poll_step(&req).await.unwrap();
        let second = ex.poll_step(&req).await.unwrap();
        assert_eq!(first.exit_code, second.exit_code);
    }

    #[tokio::test]
    async fn duplicate_step_ids_are_rejected() {
        let ex = executor(FakeEngine::succeeding());
        ex.start_step(run_request("exec-dup")).await.unwrap();
        let err = ex.start_step(run_request("exec-dup")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn stream_output_sees_step_log() {
        let engine = FakeEngine::succeeding().with_log("streamed line\n");
        let ex = executor(engine);
        ex.start_step(run_request("exec-stream")).await.unwrap();

        ex.poll_step(&PollStepRequest {
            id: "exec-stream".to_string(),
        })
        .await
        .unwrap();

        let (old, _rx) = ex
            .stream_output(&StreamOutputRequest {
                id: "exec-stream".to_string(),
                offset: 0,
            })
            .unwrap();
        assert!(String::from_utf8_lossy(&old).contains("streamed line"));
    }

    #[tokio::test]
    async fn engine_errors_surface_on_the_result() {
        let ex = executor(FakeEngine::erroring("no such image"));
        ex.start_step(run_request("exec-err")).await.unwrap();

        let resp = ex
            .poll_step(&PollStepRequest {
                id: "exec-err".to_string(),
            })
            .await
            .unwrap();
        assert!(!resp.exited);
        assert!(resp.error.contains("no such image"));
    }

    #[test]
    fn clone_image_detection() {
        assert!(is_clone_image("drone/git"));
        assert!(is_clone_image("harness/drone-git:1.6.4"));
        assert!(!is_clone_image("alpine:3"));
    }

    #[test]
    fn clone_workspace_is_anchored() {
        let mut envs = HashMap::new();
        envs.insert("DRONE_WORKSPACE".to_string(), "/drone/src".to_string());
        massage_clone_workspace(&mut envs, "/tmp/ws-abc");
        assert_eq!(envs.get("DRONE_WORKSPACE").unwrap(), "/tmp/ws-abc/drone/src");

        // already anchored values are untouched
        massage_clone_workspace(&mut envs, "/tmp/ws-abc");
        assert_eq!(envs.get("DRONE_WORKSPACE").unwrap(), "/tmp/ws-abc/drone/src");
    }
}
