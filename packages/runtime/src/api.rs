//! Wire types for the request surface. Field names and nesting mirror the
//! JSON the upstream orchestrator sends and expects back.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use stagehand_engine::spec::{Auth, File, Network, Volume, VolumeDevice, VolumeMount, PullPolicy};
use stagehand_ti::{TestReport, TiConfig};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupRequest {
    /// Stage runtime id.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub log_key: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(rename = "setup_request", default)]
    pub config: SetupRequestConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupRequestConfig {
    #[serde(default)]
    pub envs: HashMap<String, String>,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub log_config: LogConfig,
    #[serde(default)]
    pub ti_config: TiConfig,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default)]
    pub network_driver: String,
    /// Defaults to true; explicitly false on hosts without a docker socket.
    #[serde(default)]
    pub mount_docker_socket: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupResponse {
    pub ip_address: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestroyRequest {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DestroyResponse {}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub account_id: String,
    /// Upload a consolidated log on close instead of relying on the stream.
    #[serde(default)]
    pub indirect_upload: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Run,
    RunTest,
    RunTestsV2,
    Background,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunConfig {
    #[serde(rename = "commands", default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunTestConfig {
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub pre_command: String,
    #[serde(default)]
    pub post_command: String,
    #[serde(default)]
    pub build_tool: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub run_only_selected_tests: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartStepRequest {
    #[serde(default)]
    pub stage_runtime_id: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(rename = "start_step_request", default)]
    pub config: StartStepRequestConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartStepRequestConfig {
    /// Unique within the stage.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub detach: bool,
    #[serde(rename = "environment", default)]
    pub envs: HashMap<String, String>,
    #[serde(default)]
    pub log_key: String,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub kind: StepKind,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub run_test: RunTestConfig,
    #[serde(default)]
    pub output_vars: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<OutputV2>,
    #[serde(default)]
    pub test_report: TestReport,
    /// Step timeout in seconds; zero means none.
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub mount_docker_socket: Option<bool>,

    #[serde(default)]
    pub auth: Option<Auth>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub devices: Vec<VolumeDevice>,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub dns_search: Vec<String>,
    #[serde(default)]
    pub extra_hosts: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub port_bindings: HashMap<String, String>,
    #[serde(default)]
    pub cpu_period: i64,
    #[serde(default)]
    pub cpu_quota: i64,
    #[serde(default)]
    pub cpu_shares: i64,
    #[serde(default)]
    pub cpu_set: Vec<String>,
    #[serde(default)]
    pub mem_limit: i64,
    #[serde(default)]
    pub memswap_limit: i64,
    #[serde(default)]
    pub shm_size: i64,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub pull: PullPolicy,
    #[serde(default)]
    pub soft_stop: bool,
    #[serde(default)]
    pub ignore_stdout: bool,
    #[serde(default)]
    pub ignore_stderr: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    #[default]
    #[serde(alias = "")]
    String,
    Secret,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputV2 {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(rename = "type", default)]
    pub kind: OutputType,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollStepRequest {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollStepResponse {
    #[serde(default)]
    pub exited: bool,
    #[serde(default)]
    pub exit_code: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub oom_killed: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Vec<u8>>,
    #[serde(rename = "outputV2", default, skip_serializing_if = "Vec::is_empty")]
    pub output_v2: Vec<OutputV2>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamOutputRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugRequest {
    #[serde(default)]
    pub stage_runtime_id: String,
    #[serde(default)]
    pub step_id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub last: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub version: String,
    pub docker_installed: bool,
    pub git_installed: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub runner_log: String,
    pub ok: bool,
}

/// Go peers serialize `[]byte` as base64; keep the wire form compatible.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value {
            Some(text) => BASE64
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
