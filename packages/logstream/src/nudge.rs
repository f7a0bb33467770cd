//! Failure classification for step output. A nudge pairs a log pattern with
//! a suggested resolution; the first match against the captured output
//! turns a bare non-zero exit into an actionable error.

use regex::Regex;

pub struct Nudge {
    pattern: Regex,
    resolution: String,
    error: String,
}

impl Nudge {
    /// Panics if `pattern` is not a valid regex; the built-in set is
    /// validated by tests and custom sets should be too.
    pub fn new(pattern: &str, resolution: &str, error: &str) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("invalid nudge pattern"),
            resolution: resolution.to_string(),
            error: error.to_string(),
        }
    }

    pub fn matches(&self, output: &str) -> bool {
        self.pattern.is_match(output)
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn resolution(&self) -> &str {
        &self.resolution
    }
}

/// The built-in classifier set, ordered by priority.
pub fn default_nudges() -> Vec<Nudge> {
    vec![
        Nudge::new(
            "[Kk]illed",
            "Increase memory resources for the step",
            "out of memory",
        ),
        Nudge::new(
            ".*git.* SSL certificate problem",
            "Set sslVerify to false in CI codebase properties",
            "SSL certificate error",
        ),
        Nudge::new(
            "Cannot connect to the Docker daemon",
            "Set up dind if it's not running. If dind is running, privileged should be set to true",
            "could not connect to the docker daemon",
        ),
    ]
}

/// Returns the classified error message for the first matching nudge.
pub fn classify(output: &str, nudges: &[Nudge]) -> Option<String> {
    nudges
        .iter()
        .find(|n| n.matches(output))
        .map(|n| format!("{} (suggestion: {})", n.error(), n.resolution()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_kill_is_classified() {
        let nudges = default_nudges();
        let msg = classify("some output\n/bin/sh: Killed\n", &nudges).unwrap();
        assert!(msg.contains("out of memory"));
    }

    #[test]
    fn git_tls_failure_is_classified() {
        let nudges = default_nudges();
        let msg = classify(
            "fatal: unable to access repo: git clone SSL certificate problem",
            &nudges,
        )
        .unwrap();
        assert!(msg.contains("SSL certificate error"));
    }

    #[test]
    fn docker_daemon_failure_is_classified() {
        let nudges = default_nudges();
        let msg = classify(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock",
            &nudges,
        )
        .unwrap();
        assert!(msg.contains("docker daemon"));
    }

    #[test]
    fn first_match_wins() {
        let nudges = default_nudges();
        let msg = classify(
            "Killed\nCannot connect to the Docker daemon",
            &nudges,
        )
        .unwrap();
        assert!(msg.contains("out of memory"));
    }

    #[test]
    fn clean_output_is_unclassified() {
        assert!(classify("tests passed", &default_nudges()).is_none());
    }
}
