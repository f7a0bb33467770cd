//! Report collection: resolve declared report globs against the step
//! working directory, parse, and hand off to the TI client. Also collects
//! callgraph artifacts produced by instrumented test runs.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{junit, Result, TestReport, TiClient, TiConfig, TiError};

/// Parses the declared reports and uploads whatever was found. Returns the
/// number of uploaded test cases; zero when no reports matched.
pub async fn parse_and_upload(
    report: &TestReport,
    working_dir: &str,
    step_id: &str,
    client: &dyn TiClient,
) -> Result<usize> {
    if report.junit.paths.is_empty() {
        return Ok(0);
    }

    let mut files = Vec::new();
    for pattern in &report.junit.paths {
        let resolved = resolve(pattern, working_dir);
        match glob::glob(&resolved) {
            Ok(matches) => files.extend(matches.filter_map(|m| m.ok())),
            Err(err) => {
                warn!(pattern = %resolved, error = %err, "invalid report glob");
            }
        }
    }

    let tests = junit::parse_files(&files);
    if tests.is_empty() {
        return Ok(0);
    }

    debug!(step_id, count = tests.len(), "uploading test report");
    client.write_tests(step_id, "junit", &tests).await?;
    Ok(tests.len())
}

/// Report paths are commonly relative to the step workspace; absolute and
/// home-anchored paths pass through untouched.
fn resolve(pattern: &str, working_dir: &str) -> String {
    let anchored = pattern.starts_with('/')
        || pattern.starts_with('~')
        || pattern.starts_with('\\')
        || pattern.starts_with(working_dir);
    if anchored || working_dir.is_empty() {
        pattern.to_string()
    } else {
        format!("{}/{}", working_dir.trim_end_matches('/'), pattern)
    }
}

#[derive(Serialize)]
struct CallgraphFile {
    name: String,
    content: String,
}

/// Bundles the JSON/CSV callgraph files under `data_dir` and uploads them.
/// Branch resolution mirrors the service contract: PR builds use source and
/// target branches, manual builds fall back to the commit branch.
pub async fn upload_callgraph(
    config: &TiConfig,
    step_id: &str,
    time_ms: i64,
    client: &dyn TiClient,
) -> Result<usize> {
    if config.url.is_empty() {
        return Err(TiError::NotConfigured);
    }

    let is_manual =
        config.source_branch.is_empty() || config.target_branch.is_empty() || config.sha.is_empty();
    let source = if is_manual {
        if config.commit_branch.is_empty() {
            return Err(TiError::MissingBranch("commit"));
        }
        config.commit_branch.as_str()
    } else {
        config.source_branch.as_str()
    };
    let target = if is_manual {
        config.commit_branch.as_str()
    } else {
        config.target_branch.as_str()
    };

    let dir = Path::new(&config.data_dir).join("callgraph");
    let files = collect_files(&dir, &["json", "csv"]);
    if files.is_empty() {
        return Ok(0);
    }

    let mut bundle = Vec::new();
    for path in &files {
        match std::fs::read_to_string(path) {
            Ok(content) => bundle.push(CallgraphFile {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                content,
            }),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not read callgraph file");
            }
        }
    }
    let data = serde_json::to_vec(&bundle).unwrap_or_default();
    let count = bundle.len();
    client
        .upload_callgraph(step_id, source, target, time_ms, data)
        .await?;
    Ok(count)
}

fn collect_files(dir: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for ext in extensions {
        let pattern = format!("{}/**/*.{}", dir.display(), ext);
        if let Ok(matches) = glob::glob(&pattern) {
            files.extend(matches.filter_map(|m| m.ok()));
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JunitReport, ReportKind, TestCase};
    use std::sync::Mutex;

    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        tests: Mutex<Vec<TestCase>>,
        callgraphs: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl TiClient for Recorder {
        async fn write_tests(
            &self,
            _step_id: &str,
            _report_type: &str,
            tests: &[TestCase],
        ) -> Result<()> {
            self.tests.lock().unwrap().extend(tests.iter().cloned());
            Ok(())
        }

        async fn upload_callgraph(
            &self,
            _step_id: &str,
            _source: &str,
            _target: &str,
            _time_ms: i64,
            data: Vec<u8>,
        ) -> Result<()> {
            self.callgraphs.lock().unwrap().push(data);
            Ok(())
        }
    }

    const REPORT: &str = r#"<testsuite name="s">
  <testcase classname="c" name="one" time="0.1"/>
  <testcase classname="c" name="two" time="0.2"/>
</testsuite>"#;

    #[tokio::test]
    async fn relative_globs_resolve_against_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("target/reports")).unwrap();
        std::fs::write(dir.path().join("target/reports/junit.xml"), REPORT).unwrap();

        let report = TestReport {
            kind: ReportKind::Junit,
            junit: JunitReport {
                paths: vec!["target/reports/*.xml".to_string()],
            },
        };
        let recorder = Recorder::default();
        let count = parse_and_upload(
            &report,
            &dir.path().to_string_lossy(),
            "st1",
            &recorder,
        )
        .await
        .unwrap();

        assert_eq!(count, 2);
        assert_eq!(recorder.tests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_paths_upload_nothing() {
        let recorder = Recorder::default();
        let report = TestReport::default();
        let count = parse_and_upload(&report, "/tmp", "st1", &recorder)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(recorder.tests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn callgraph_bundle_requires_branches() {
        let recorder = Recorder::default();
        let config = TiConfig {
            url: "https://ti.example.com".to_string(),
            ..Default::default()
        };
        let err = upload_callgraph(&config, "st1", 10, &recorder)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("commit branch"));
    }

    #[tokio::test]
    async fn callgraph_bundle_collects_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let cg = dir.path().join("callgraph");
        std::fs::create_dir_all(&cg).unwrap();
        std::fs::write(cg.join("nodes.json"), "{}").unwrap();

        let recorder = Recorder::default();
        let config = TiConfig {
            url: "https://ti.example.com".to_string(),
            commit_branch: "main".to_string(),
            data_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let count = upload_callgraph(&config, "st1", 10, &recorder)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(recorder.callgraphs.lock().unwrap().len(), 1);
    }
}
