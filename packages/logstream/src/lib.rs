//! Log pipeline for step output. A step owns exactly one [`LiveLog`] sink;
//! the sink buffers lines, fans them out to live tails, and ships them to a
//! [`LogClient`] chosen at stage setup (file-backed or remote streaming).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod filestore;
pub mod livelog;
pub mod nudge;
pub mod remote;

pub use filestore::FileStore;
pub use livelog::LiveLog;
pub use nudge::Nudge;
pub use remote::RemoteClient;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("log service returned status {0}")]
    Status(u16),

    #[error("log stream already closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, LogError>;

/// One line of captured step output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Line {
    pub level: String,
    pub pos: i64,
    pub out: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub args: HashMap<String, String>,
}

impl Line {
    pub fn output(pos: i64, out: impl Into<String>) -> Self {
        Self {
            level: "info".to_string(),
            pos,
            out: out.into(),
            time: Utc::now(),
            args: HashMap::new(),
        }
    }
}

/// A log service client. One stage holds one client; keys identify steps.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Open the stream for the key.
    async fn open(&self, key: &str) -> Result<()>;

    /// Append lines to the stream.
    async fn write(&self, key: &str, lines: &[Line]) -> Result<()>;

    /// Upload the full log history in one shot.
    async fn upload(&self, key: &str, lines: &[Line]) -> Result<()>;

    /// Close the stream.
    async fn close(&self, key: &str) -> Result<()>;
}

/// Byte sink shared between the engine's container log tail and the step
/// executor. Implementations must tolerate concurrent writers.
pub trait Sink: Send + Sync {
    fn write(&self, data: &[u8]);
}
