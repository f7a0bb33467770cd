//! Stage setup: install the stage in the registry and provision the
//! sandbox. On provisioning failure the registry entry is removed before
//! the response returns.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use super::Json;
use sha2::{Digest, Sha256};
use tracing::{error, info};
use uuid::Uuid;

use stagehand_engine::spec::{HostPathVolume, Network, PipelineConfig, Platform, Volume};
use stagehand_engine::{
    DockerEngine, Engine, Opts, DOCKER_SOCK_UNIX_PATH, DOCKER_SOCK_VOLUME_NAME,
    DOCKER_SOCK_WIN_PATH,
};
use stagehand_runtime::api::{SetupRequest, SetupResponse};
use stagehand_runtime::pipeline::{SHARED_VOL_NAME, SHARED_VOL_PATH, TI_VOL_NAME, TI_VOL_PATH};
use stagehand_runtime::{PipelineState, StageData, StepExecutor};

use super::AppState;
use crate::error::AppError;

pub async fn handle_setup(
    State(state): State<AppState>,
    Json(mut req): Json<SetupRequest>,
) -> Result<Json<SetupResponse>, AppError> {
    if req.id.is_empty() {
        return Err(AppError::BadRequest("id not specified".to_string()));
    }
    let started = Instant::now();

    set_proxy_envs(&req.config.envs);

    // the clone workspace is hashed per stage so concurrent stages on one
    // host cannot collide
    update_volumes(&mut req.config.volumes, &req.id);

    let ti_volume = ti_volume(&req.id);
    let ti_dir = ti_volume.path.clone();
    req.config.volumes.push(Volume::HostPath(ti_volume));
    let mut ti_config = req.config.ti_config.clone();
    ti_config.data_dir = ti_dir;

    if req.config.mount_docker_socket.unwrap_or(true) {
        req.config.volumes.push(Volume::HostPath(docker_sock_volume()));
    }
    req.config.volumes.push(Volume::HostPath(shared_volume()));
    req.config
        .volumes
        .extend(global_volumes(&state.config.runner.volumes)?);

    let engine: Arc<dyn Engine> = Arc::new(
        DockerEngine::connect(Opts::default()).map_err(|err| {
            error!(error = %err, "could not instantiate engine for the execution");
            AppError::from(err)
        })?,
    );

    let pipeline_state = Arc::new(PipelineState::new());
    pipeline_state.set(
        req.config.volumes.clone(),
        req.config.secrets.clone(),
        req.config.log_config.clone(),
        ti_config,
        req.config.network.id.clone(),
    );
    let executor = Arc::new(StepExecutor::new(engine.clone(), pipeline_state.clone()));
    let stage = Arc::new(StageData::new(engine.clone(), pipeline_state, executor));

    state.registry.add(&req.id, stage)?;

    let pipeline_config = PipelineConfig {
        envs: req.config.envs.clone(),
        network: Network {
            id: req.config.network.id.clone(),
            options: req.config.network.options.clone(),
            labels: req.config.network.labels.clone(),
        },
        platform: Platform {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        },
        volumes: req.config.volumes.clone(),
        files: req.config.files.clone(),
        network_driver: req.config.network_driver.clone(),
        enable_docker_setup: req.config.mount_docker_socket.unwrap_or(true),
    };

    if let Err(err) = engine.setup(&pipeline_config).await {
        error!(id = %req.id, error = %err, latency = ?started.elapsed(), "stage setup failed");
        // setup failures leave the registry clean
        let _ = state.registry.remove(&req.id);
        return Err(err.into());
    }

    info!(id = %req.id, latency = ?started.elapsed(), "completed the stage setup");
    Ok(Json(SetupResponse {
        ip_address: "127.0.0.1".to_string(),
        instance_id: Uuid::new_v4().to_string(),
    }))
}

/// Clone-workspace host paths (id `harness`) are created and removed with
/// the stage, under a path suffixed by a hash of the stage id.
fn update_volumes(volumes: &mut [Volume], stage_id: &str) {
    for volume in volumes {
        if let Volume::HostPath(host_path) = volume {
            if host_path.id == "harness" {
                host_path.create = true;
                host_path.remove = true;
                host_path.path = format!("{}-{}", host_path.path, stage_hash(stage_id));
                host_path.container_path = host_path.path.clone();
            }
        }
    }
}

fn stage_hash(stage_id: &str) -> String {
    let digest = Sha256::digest(stage_id.as_bytes());
    let mut hash = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        hash.push_str(&format!("{byte:02x}"));
    }
    hash
}

fn shared_volume() -> HostPathVolume {
    HostPathVolume {
        id: "engine".to_string(),
        name: SHARED_VOL_NAME.to_string(),
        path: SHARED_VOL_PATH.to_string(),
        container_path: SHARED_VOL_PATH.to_string(),
        create: true,
        ..Default::default()
    }
}

/// Per-stage directory for callgraph and agent data produced by
/// instrumented test runs.
fn ti_volume(stage_id: &str) -> HostPathVolume {
    HostPathVolume {
        id: String::new(),
        name: TI_VOL_NAME.to_string(),
        path: format!("{}-{}", TI_VOL_PATH, stage_hash(stage_id)),
        container_path: TI_VOL_PATH.to_string(),
        create: true,
        remove: true,
        ..Default::default()
    }
}

fn docker_sock_volume() -> HostPathVolume {
    let path = if cfg!(windows) {
        DOCKER_SOCK_WIN_PATH
    } else {
        DOCKER_SOCK_UNIX_PATH
    };
    HostPathVolume {
        id: "docker".to_string(),
        name: DOCKER_SOCK_VOLUME_NAME.to_string(),
        path: path.to_string(),
        container_path: path.to_string(),
        ..Default::default()
    }
}

/// `src:dest` mounts from `CI_MOUNT_VOLUMES`, exposed to every step.
fn global_volumes(specs: &[String]) -> Result<Vec<Volume>, AppError> {
    let mut volumes = Vec::new();
    for (index, spec) in specs.iter().enumerate() {
        let (src, dest) = spec.split_once(':').ok_or_else(|| {
            AppError::BadRequest(format!("volume {spec} is not in the format src:dest"))
        })?;
        volumes.push(Volume::HostPath(HostPathVolume {
            id: format!("global-{index}"),
            name: format!("_global_{index}"),
            path: src.to_string(),
            container_path: dest.to_string(),
            ..Default::default()
        }));
    }
    Ok(volumes)
}

fn set_proxy_envs(envs: &std::collections::HashMap<String, String>) {
    // always set every proxy var; absent entries clear any value left over
    // from an earlier stage setup
    for name in [
        "http_proxy",
        "https_proxy",
        "no_proxy",
        "HTTP_PROXY",
        "HTTPS_PROXY",
        "NO_PROXY",
    ] {
        std::env::set_var(name, envs.get(name).map(String::as_str).unwrap_or(""));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_volumes_are_hashed_and_reclaimed() {
        let mut volumes = vec![Volume::HostPath(HostPathVolume {
            id: "harness".to_string(),
            name: "harness".to_string(),
            path: "/tmp/ws".to_string(),
            ..Default::default()
        })];
        update_volumes(&mut volumes, "stage-1");

        let hp = volumes[0].as_host_path().unwrap();
        assert!(hp.create);
        assert!(hp.remove);
        assert_ne!(hp.path, "/tmp/ws");
        assert!(hp.path.starts_with("/tmp/ws-"));

        // same stage id, same path; different stage id, different path
        let mut again = vec![Volume::HostPath(HostPathVolume {
            id: "harness".to_string(),
            name: "harness".to_string(),
            path: "/tmp/ws".to_string(),
            ..Default::default()
        })];
        update_volumes(&mut again, "stage-1");
        assert_eq!(again[0].as_host_path().unwrap().path, hp.path);

        let mut other = vec![Volume::HostPath(HostPathVolume {
            id: "harness".to_string(),
            name: "harness".to_string(),
            path: "/tmp/ws".to_string(),
            ..Default::default()
        })];
        update_volumes(&mut other, "stage-2");
        assert_ne!(other[0].as_host_path().unwrap().path, hp.path);
    }

    #[test]
    fn global_volumes_require_src_dest_form() {
        let volumes =
            global_volumes(&["/src:/dest".to_string(), "/a:/b".to_string()]).unwrap();
        assert_eq!(volumes.len(), 2);
        let hp = volumes[0].as_host_path().unwrap();
        assert_eq!(hp.path, "/src");
        assert_eq!(hp.container_path, "/dest");

        assert!(global_volumes(&["nocolon".to_string()]).is_err());
    }

    #[test]
    fn ti_volume_is_stage_scoped() {
        let a = ti_volume("stage-1");
        let b = ti_volume("stage-2");
        assert_ne!(a.path, b.path);
        assert!(a.remove);
        assert_eq!(a.container_path, TI_VOL_PATH);
    }
}
