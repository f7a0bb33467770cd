//! Test-intelligence ingestion: JUnit report parsing, callgraph collection,
//! and the upload client the step executor hands results to.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod junit;
pub mod report;

pub use client::{HttpTiClient, TiClient};

#[derive(Error, Debug)]
pub enum TiError {
    #[error("unknown report kind: {0}")]
    UnknownReportKind(String),

    #[error("test intelligence endpoint is not configured")]
    NotConfigured,

    #[error("{0} branch is not set")]
    MissingBranch(&'static str),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("test intelligence service returned status {0}")]
    Status(u16),

    #[error("malformed report: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TiError>;

/// Upstream-supplied configuration for the TI service, captured at stage
/// setup. `data_dir` is the per-stage host directory instrumented runs
/// write callgraph artifacts into.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TiConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub pipeline_id: String,
    #[serde(default)]
    pub build_id: String,
    #[serde(default)]
    pub stage_id: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub commit_link: String,
    #[serde(default)]
    pub source_branch: String,
    #[serde(default)]
    pub target_branch: String,
    #[serde(default)]
    pub commit_branch: String,
    #[serde(default)]
    pub data_dir: String,
}

/// Declared test report for a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestReport {
    #[serde(default)]
    pub kind: ReportKind,
    #[serde(default)]
    pub junit: JunitReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReportKind {
    #[default]
    #[serde(rename = "Junit", alias = "junit", alias = "")]
    Junit,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JunitReport {
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

/// One parsed test case, flattened for upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub name: String,
    pub class_name: String,
    pub suite_name: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub duration_ms: i64,
}
