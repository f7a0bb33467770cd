//! End-to-end sandbox lifecycle against a live Docker daemon.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use stagehand_engine::spec::{
    HostPathVolume, Network, PipelineConfig, Platform, Step, Volume, VolumeMount,
};
use stagehand_engine::{DockerEngine, Engine, Opts};
use stagehand_logstream::Sink;

#[derive(Default)]
struct Capture(Mutex<Vec<u8>>);

impl Sink for Capture {
    fn write(&self, data: &[u8]) {
        self.0.lock().unwrap().extend_from_slice(data);
    }
}

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

fn test_pipeline(suffix: &str) -> (PipelineConfig, String) {
    let workspace = format!("/tmp/stagehand-test-ws-{suffix}");
    let config = PipelineConfig {
        network: Network {
            id: format!("stagehand-test-net-{suffix}"),
            ..Default::default()
        },
        platform: Platform {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        },
        volumes: vec![Volume::HostPath(HostPathVolume {
            id: "harness".to_string(),
            name: "harness".to_string(),
            path: workspace.clone(),
            create: true,
            remove: true,
            ..Default::default()
        })],
        ..Default::default()
    };
    (config, workspace)
}

#[tokio::test]
#[ignore] // requires a docker daemon
async fn sandbox_lifecycle_runs_a_step_and_cleans_up() {
    let suffix = std::process::id().to_string();
    let engine = DockerEngine::connect(Opts::default()).unwrap();
    engine.ping().await.unwrap();

    let (config, workspace) = test_pipeline(&suffix);
    engine.setup(&config).await.unwrap();
    assert!(std::path::Path::new(&workspace).exists());

    let step = Step {
        id: format!("stagehand-test-step-{suffix}"),
        name: "hello".to_string(),
        image: "alpine:3".to_string(),
        entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
        command: vec!["echo hello-sandbox".to_string()],
        volumes: vec![VolumeMount {
            name: "harness".to_string(),
            path: "/workspace".to_string(),
        }],
        ..Default::default()
    };
    let output = Arc::new(Capture::default());
    let state = engine
        .run(&step, output.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert!(state.exited);
    assert_eq!(state.exit_code, 0);
    assert!(!state.oom_killed);
    // the log tail races the wait; give it a moment to drain
    for _ in 0..50 {
        if output.text().contains("hello-sandbox") {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    assert!(output.text().contains("hello-sandbox"));

    engine.destroy().await.unwrap();
    assert!(!std::path::Path::new(&workspace).exists());

    // destroy is idempotent: a second call finds nothing and still succeeds
    engine.destroy().await.unwrap();
}

#[tokio::test]
#[ignore] // requires a docker daemon
async fn failed_steps_report_their_exit_code() {
    let suffix = format!("{}-fail", std::process::id());
    let engine = DockerEngine::connect(Opts::default()).unwrap();

    let (config, _workspace) = test_pipeline(&suffix);
    engine.setup(&config).await.unwrap();

    let step = Step {
        id: format!("stagehand-test-step-{suffix}"),
        name: "fails".to_string(),
        image: "alpine:3".to_string(),
        entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
        command: vec!["exit 7".to_string()],
        ..Default::default()
    };
    let output = Arc::new(Capture::default());
    let state = engine
        .run(&step, output, CancellationToken::new())
        .await
        .unwrap();

    assert!(state.exited);
    assert_eq!(state.exit_code, 7);

    engine.destroy().await.unwrap();
}
