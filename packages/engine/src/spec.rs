//! Container-level data model shared by the sandbox engine and the step
//! executor. These types mirror the JSON the upstream orchestrator sends.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Image pull behavior for a step container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Pull only when the image tag is `latest` or unpinned.
    #[default]
    #[serde(alias = "")]
    Default,
    /// Pull before every run.
    Always,
    /// Pull only when the image is missing locally.
    IfNotExists,
    /// Never pull; fail if the image is missing.
    Never,
}

/// Registry credentials used for authenticated pulls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// The per-stage network all step containers attach to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Host platform the stage runs on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
}

/// A named volume available to step containers. Externally tagged so the
/// wire form is `{"empty_dir": {...}}` or `{"host_path": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Volume {
    EmptyDir(EmptyDirVolume),
    HostPath(HostPathVolume),
}

impl Volume {
    /// The mount name steps reference this volume by.
    pub fn name(&self) -> &str {
        match self {
            Volume::EmptyDir(v) => &v.name,
            Volume::HostPath(v) => &v.name,
        }
    }

    pub fn as_host_path(&self) -> Option<&HostPathVolume> {
        match self {
            Volume::HostPath(v) => Some(v),
            Volume::EmptyDir(_) => None,
        }
    }

    pub fn as_empty_dir(&self) -> Option<&EmptyDirVolume> {
        match self {
            Volume::EmptyDir(v) => Some(v),
            Volume::HostPath(_) => None,
        }
    }
}

/// A docker volume created at stage setup and removed at destroy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyDirVolume {
    pub id: String,
    pub name: String,
    /// `memory` selects a tmpfs; tmpfs volumes have no backing volume
    /// object and are skipped at destroy.
    #[serde(default)]
    pub medium: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// A host directory bind-mounted into step containers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostPathVolume {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub path: String,
    /// When set, the volume is mounted here in every step container.
    #[serde(default)]
    pub container_path: String,
    /// mkdir -p on the host at setup.
    #[serde(default)]
    pub create: bool,
    /// rm -rf on the host at destroy.
    #[serde(default)]
    pub remove: bool,
    #[serde(default)]
    pub read_only: bool,
}

/// Reference from a step to a volume declared on the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub path: String,
}

/// A file materialized on the host before the stage runs and removed at
/// destroy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct File {
    pub path: String,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub data: String,
}

/// Device mapping exposed to a step container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeDevice {
    pub name: String,
    pub device_path: String,
}

/// Everything the engine needs to run one step as a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub devices: Vec<VolumeDevice>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
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
    /// Host port to container port.
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

    /// Primary network override; empty means the stage network.
    #[serde(default)]
    pub network: String,
    /// Extra user-defined networks to attach after create.
    #[serde(default)]
    pub networks: Vec<String>,

    #[serde(default)]
    pub pull: PullPolicy,
    #[serde(default)]
    pub auth: Option<Auth>,
    /// SIGTERM with a grace period instead of an immediate SIGKILL at
    /// destroy.
    #[serde(default)]
    pub soft_stop: bool,
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub ignore_stdout: bool,
    #[serde(default)]
    pub ignore_stderr: bool,
}

/// The sandbox provisioned for one stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub envs: HashMap<String, String>,
    pub network: Network,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub files: Vec<File>,
    /// Overrides the platform default (`bridge`, `nat` on windows).
    #[serde(default)]
    pub network_driver: String,
    #[serde(default)]
    pub enable_docker_setup: bool,
}

/// Terminal container state reported back to the executor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunState {
    pub exited: bool,
    pub exit_code: i64,
    pub oom_killed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_wire_form_is_externally_tagged() {
        let v: Volume = serde_json::from_str(
            r#"{"host_path": {"name": "harness", "path": "/tmp/ws", "id": "harness", "create": true}}"#,
        )
        .unwrap();
        let hp = v.as_host_path().unwrap();
        assert_eq!(hp.name, "harness");
        assert!(hp.create);
        assert!(!hp.remove);

        let v: Volume =
            serde_json::from_str(r#"{"empty_dir": {"id": "cache-0", "name": "cache"}}"#).unwrap();
        assert_eq!(v.name(), "cache");
    }

    #[test]
    fn pull_policy_accepts_wire_values() {
        assert_eq!(
            serde_json::from_str::<PullPolicy>(r#""if-not-exists""#).unwrap(),
            PullPolicy::IfNotExists
        );
        assert_eq!(
            serde_json::from_str::<PullPolicy>(r#""always""#).unwrap(),
            PullPolicy::Always
        );
        assert_eq!(
            serde_json::from_str::<PullPolicy>(r#""""#).unwrap(),
            PullPolicy::Default
        );
    }

    #[test]
    fn step_defaults_are_permissive() {
        let s: Step = serde_json::from_str(r#"{"id": "st1", "image": "alpine:3"}"#).unwrap();
        assert_eq!(s.pull, PullPolicy::Default);
        assert!(!s.soft_stop);
        assert!(s.network.is_empty());
    }
}
