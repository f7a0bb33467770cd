//! Remote log service client. Streams line batches while the step runs and
//! can upload a consolidated log on close.

use async_trait::async_trait;
use reqwest::Method;

use crate::{Line, LogClient, LogError, Result};

const TOKEN_HEADER: &str = "X-Harness-Token";

pub struct RemoteClient {
    client: reqwest::Client,
    endpoint: String,
    account_id: String,
    token: String,
    indirect_upload: bool,
}

impl RemoteClient {
    pub fn new(
        endpoint: impl Into<String>,
        account_id: impl Into<String>,
        token: impl Into<String>,
        indirect_upload: bool,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            account_id: account_id.into(),
            token: token.into(),
            indirect_upload,
        }
    }

    /// Whether `close` should be preceded by a consolidated upload.
    pub fn indirect_upload(&self) -> bool {
        self.indirect_upload
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        key: &str,
        extra: &[(&str, &str)],
        body: Option<&[Line]>,
    ) -> Result<()> {
        let url = format!("{}/{}", self.endpoint, path);
        let mut req = self
            .client
            .request(method, url)
            .header(TOKEN_HEADER, &self.token)
            .query(&[("accountID", self.account_id.as_str()), ("key", key)])
            .query(extra);
        if let Some(lines) = body {
            req = req.json(lines);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(LogError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl LogClient for RemoteClient {
    async fn open(&self, key: &str) -> Result<()> {
        self.send(Method::POST, "stream", key, &[], None).await
    }

    async fn write(&self, key: &str, lines: &[Line]) -> Result<()> {
        self.send(Method::PUT, "stream", key, &[], Some(lines)).await
    }

    async fn upload(&self, key: &str, lines: &[Line]) -> Result<()> {
        self.send(Method::POST, "blob", key, &[], Some(lines)).await
    }

    async fn close(&self, key: &str) -> Result<()> {
        self.send(Method::DELETE, "stream", key, &[("snapshot", "true")], None)
            .await
    }
}
