//! JUnit XML parsing. Accepts both `<testsuites>` and bare `<testsuite>`
//! roots, including nested suites, and flattens everything into test cases.

use serde::Deserialize;
use tracing::warn;

use crate::{Result, TestCase, TestStatus};

#[derive(Debug, Deserialize)]
struct XmlTestSuites {
    #[serde(rename = "testsuite", default)]
    suites: Vec<XmlTestSuite>,
}

#[derive(Debug, Deserialize)]
struct XmlTestSuite {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "testsuite", default)]
    suites: Vec<XmlTestSuite>,
    #[serde(rename = "testcase", default)]
    cases: Vec<XmlTestCase>,
}

#[derive(Debug, Deserialize)]
struct XmlTestCase {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "@classname", default)]
    class_name: String,
    #[serde(rename = "@time", default)]
    time: String,
    #[serde(default)]
    failure: Vec<XmlDetail>,
    #[serde(default)]
    error: Vec<XmlDetail>,
    #[serde(default)]
    skipped: Vec<XmlDetail>,
}

#[derive(Debug, Deserialize)]
struct XmlDetail {
    #[serde(rename = "@message", default)]
    message: String,
    #[serde(rename = "$text", default)]
    text: String,
}

impl XmlDetail {
    fn message(&self) -> String {
        if !self.message.is_empty() {
            self.message.clone()
        } else {
            self.text.trim().to_string()
        }
    }
}

/// Parses one JUnit document into flat test cases.
pub fn parse(content: &str) -> Result<Vec<TestCase>> {
    // the root element name is not part of the serde mapping, so a bare
    // <testsuite> document parses as a suite list with no entries
    let root: XmlTestSuites = quick_xml::de::from_str(content)?;
    let mut cases = Vec::new();
    if root.suites.is_empty() {
        let suite: XmlTestSuite = quick_xml::de::from_str(content)?;
        collect(&suite, &mut cases);
    } else {
        for suite in &root.suites {
            collect(suite, &mut cases);
        }
    }
    Ok(cases)
}

/// Parses every file, skipping unreadable or malformed ones with a warning.
pub fn parse_files(paths: &[std::path::PathBuf]) -> Vec<TestCase> {
    let mut tests = Vec::new();
    for path in paths {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not read report file");
                continue;
            }
        };
        match parse(&content) {
            Ok(mut cases) => tests.append(&mut cases),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not parse report file");
            }
        }
    }
    tests
}

fn collect(suite: &XmlTestSuite, out: &mut Vec<TestCase>) {
    for case in &suite.cases {
        let (status, message) = if let Some(detail) = case.error.first() {
            (TestStatus::Error, detail.message())
        } else if let Some(detail) = case.failure.first() {
            (TestStatus::Failed, detail.message())
        } else if let Some(detail) = case.skipped.first() {
            (TestStatus::Skipped, detail.message())
        } else {
            (TestStatus::Passed, String::new())
        };

        out.push(TestCase {
            name: case.name.clone(),
            class_name: case.class_name.clone(),
            suite_name: suite.name.clone(),
            status,
            message,
            duration_ms: duration_ms(&case.time),
        });
    }
    for nested in &suite.suites {
        collect(nested, out);
    }
}

fn duration_ms(time: &str) -> i64 {
    time.trim()
        .parse::<f64>()
        .map(|secs| (secs * 1000.0) as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuites>
  <testsuite name="auth" tests="3" failures="1">
    <testcase classname="auth.login" name="accepts valid token" time="0.25"/>
    <testcase classname="auth.login" name="rejects expired token" time="1.5">
      <failure message="expected 401, got 200">stack trace here</failure>
    </testcase>
    <testcase classname="auth.login" name="skipped on windows">
      <skipped message="windows only"/>
    </testcase>
  </testsuite>
</testsuites>"#;

    #[test]
    fn parses_testsuites_root() {
        let cases = parse(REPORT).unwrap();
        assert_eq!(cases.len(), 3);

        assert_eq!(cases[0].status, TestStatus::Passed);
        assert_eq!(cases[0].duration_ms, 250);
        assert_eq!(cases[0].suite_name, "auth");

        assert_eq!(cases[1].status, TestStatus::Failed);
        assert_eq!(cases[1].message, "expected 401, got 200");
        assert_eq!(cases[1].duration_ms, 1500);

        assert_eq!(cases[2].status, TestStatus::Skipped);
    }

    #[test]
    fn parses_bare_testsuite_root() {
        let report = r#"<testsuite name="unit">
  <testcase classname="pkg" name="works" time="0.001"/>
  <testcase classname="pkg" name="explodes"><error message="boom"/></testcase>
</testsuite>"#;
        let cases = parse(report).unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].duration_ms, 1);
        assert_eq!(cases[1].status, TestStatus::Error);
        assert_eq!(cases[1].message, "boom");
    }

    #[test]
    fn parses_nested_suites() {
        let report = r#"<testsuites>
  <testsuite name="outer">
    <testsuite name="inner">
      <testcase classname="pkg" name="deep"/>
    </testsuite>
  </testsuite>
</testsuites>"#;
        let cases = parse(report).unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].suite_name, "inner");
    }

    #[test]
    fn failure_body_is_used_when_message_attr_is_absent() {
        let report = r#"<testsuite name="s">
  <testcase classname="c" name="n"><failure>assertion failed
left != right</failure></testcase>
</testsuite>"#;
        let cases = parse(report).unwrap();
        assert!(cases[0].message.starts_with("assertion failed"));
    }

    #[test]
    fn malformed_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.xml");
        let bad = dir.path().join("bad.xml");
        std::fs::write(&good, REPORT).unwrap();
        std::fs::write(&bad, "<not junit").unwrap();

        let tests = parse_files(&[good, bad]);
        assert_eq!(tests.len(), 3);
    }
}
