//! Upload client for the test-intelligence service.

use async_trait::async_trait;

use crate::{Result, TestCase, TiConfig, TiError};

const TOKEN_HEADER: &str = "X-Harness-Token";

#[async_trait]
pub trait TiClient: Send + Sync {
    /// Ship parsed test cases for a step.
    async fn write_tests(&self, step_id: &str, report_type: &str, tests: &[TestCase])
        -> Result<()>;

    /// Ship a collected callgraph bundle for a step.
    async fn upload_callgraph(
        &self,
        step_id: &str,
        source: &str,
        target: &str,
        time_ms: i64,
        data: Vec<u8>,
    ) -> Result<()>;
}

pub struct HttpTiClient {
    client: reqwest::Client,
    config: TiConfig,
}

impl HttpTiClient {
    pub fn new(config: TiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self, path: &str) -> Result<String> {
        if self.config.url.is_empty() {
            return Err(TiError::NotConfigured);
        }
        Ok(format!("{}/{}", self.config.url.trim_end_matches('/'), path))
    }

    fn context_query(&self, step_id: &str) -> Vec<(&'static str, String)> {
        let c = &self.config;
        vec![
            ("accountId", c.account_id.clone()),
            ("orgId", c.org_id.clone()),
            ("projectId", c.project_id.clone()),
            ("pipelineId", c.pipeline_id.clone()),
            ("buildId", c.build_id.clone()),
            ("stageId", c.stage_id.clone()),
            ("stepId", step_id.to_string()),
            ("repo", c.repo.clone()),
            ("sha", c.sha.clone()),
        ]
    }

    fn check(resp: &reqwest::Response) -> Result<()> {
        if !resp.status().is_success() {
            return Err(TiError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl TiClient for HttpTiClient {
    async fn write_tests(
        &self,
        step_id: &str,
        report_type: &str,
        tests: &[TestCase],
    ) -> Result<()> {
        let url = self.endpoint("reports/write")?;
        let resp = self
            .client
            .post(url)
            .header(TOKEN_HEADER, &self.config.token)
            .query(&self.context_query(step_id))
            .query(&[("report", report_type)])
            .json(tests)
            .send()
            .await?;
        Self::check(&resp)
    }

    async fn upload_callgraph(
        &self,
        step_id: &str,
        source: &str,
        target: &str,
        time_ms: i64,
        data: Vec<u8>,
    ) -> Result<()> {
        let url = self.endpoint("agents/callgraph")?;
        let resp = self
            .client
            .post(url)
            .header(TOKEN_HEADER, &self.config.token)
            .query(&self.context_query(step_id))
            .query(&[
                ("source", source),
                ("target", target),
                ("timeMs", &time_ms.to_string()),
            ])
            .body(data)
            .send()
            .await?;
        Self::check(&resp)
    }
}
