//! Scriptable engine doubles for executor and registry tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use stagehand_engine::spec::{PipelineConfig, RunState, Step};
use stagehand_engine::{Engine, EngineError, Result};
use stagehand_logstream::Sink;

/// An engine that accepts everything and runs nothing.
#[derive(Default)]
pub struct NullEngine;

#[async_trait]
impl Engine for NullEngine {
    async fn setup(&self, _config: &PipelineConfig) -> Result<()> {
        Ok(())
    }

    async fn run(
        &self,
        _step: &Step,
        _output: Arc<dyn Sink>,
        _cancel: CancellationToken,
    ) -> Result<RunState> {
        Ok(RunState {
            exited: true,
            exit_code: 0,
            oom_killed: false,
        })
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn debug(&self, _step_id: &str, _command: &str, _last: bool) -> Result<()> {
        Ok(())
    }
}

/// An engine scripted per test: fixed exit state, canned log output, and an
/// optional output file written where the step's shell would write it.
pub struct FakeEngine {
    exit_code: i64,
    error: Option<String>,
    log: String,
    output_file_content: Option<String>,
    steps: Arc<Mutex<Vec<Step>>>,
}

impl FakeEngine {
    pub fn succeeding() -> Self {
        Self {
            exit_code: 0,
            error: None,
            log: String::new(),
            output_file_content: None,
            steps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(exit_code: i64) -> Self {
        Self {
            exit_code,
            ..Self::succeeding()
        }
    }

    pub fn erroring(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::succeeding()
        }
    }

    pub fn with_log(mut self, log: &str) -> Self {
        self.log = log.to_string();
        self
    }

    pub fn with_output_file(mut self, content: &str) -> Self {
        self.output_file_content = Some(content.to_string());
        self
    }

    /// Every step this engine has been asked to run.
    pub fn steps(&self) -> Arc<Mutex<Vec<Step>>> {
        self.steps.clone()
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn setup(&self, _config: &PipelineConfig) -> Result<()> {
        Ok(())
    }

    async fn run(
        &self,
        step: &Step,
        output: Arc<dyn Sink>,
        _cancel: CancellationToken,
    ) -> Result<RunState> {
        self.steps.lock().unwrap().push(step.clone());
        if !self.log.is_empty() {
            output.write(self.log.as_bytes());
        }
        if let Some(content) = &self.output_file_content {
            if let Some(path) = step.envs.get("DRONE_OUTPUT") {
                std::fs::write(path, content)?;
            }
        }
        if let Some(message) = &self.error {
            return Err(EngineError::Pull(message.clone()));
        }
        Ok(RunState {
            exited: true,
            exit_code: self.exit_code,
            oom_killed: false,
        })
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn debug(&self, _step_id: &str, _command: &str, _last: bool) -> Result<()> {
        Ok(())
    }
}
