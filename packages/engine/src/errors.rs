use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("image pull failed: {0}")]
    Pull(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("context canceled")]
    Canceled,

    #[error("shell session error: {0}")]
    Shell(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// True when the daemon reported 404 for the referenced object, which
    /// for container create means the image is missing locally.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })
        )
    }
}

/// Strips the daemon boilerplate so callers see the useful part of the
/// message.
pub fn trim_daemon_noise(message: &str) -> String {
    let trimmed = message
        .split("Error response from daemon:")
        .last()
        .unwrap_or(message)
        .trim();
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_prefix_is_trimmed() {
        assert_eq!(
            trim_daemon_noise("Error response from daemon: No such image: neverlocal:1"),
            "No such image: neverlocal:1"
        );
        assert_eq!(trim_daemon_noise("plain message"), "plain message");
    }
}
