use std::env;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid delegate capacity: {0}")]
    InvalidCapacity(#[from] std::num::ParseIntError),
}

/// System configuration, loaded from the environment.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub debug: bool,
    pub trace: bool,
    pub server_name: String,

    pub server: ServerConfig,
    pub runner: RunnerConfig,
    pub delegate: DelegateConfig,
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub bind: String,
    pub cert_file: String,
    pub key_file: String,
    pub ca_cert_file: String,
    pub skip_prepare_server: bool,
    pub insecure: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// `src:dest` bind mounts appended to every step.
    pub volumes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DelegateConfig {
    pub manager_endpoint: String,
    pub secret: String,
    pub account_id: String,
    pub max_builds: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let server = ServerConfig {
            bind: env_or("HTTPS_BIND", ":3000"),
            cert_file: env_or("SERVER_CERT_FILE", "/tmp/certs/server-cert.pem"),
            key_file: env_or("SERVER_KEY_FILE", "/tmp/certs/server-key.pem"),
            ca_cert_file: env_or("CLIENT_CERT_FILE", "/tmp/certs/ca-cert.pem"),
            skip_prepare_server: env_bool("SKIP_PREPARE_SERVER", false),
            insecure: env_bool("SERVER_INSECURE", true),
        };

        let runner = RunnerConfig {
            volumes: env::var("CI_MOUNT_VOLUMES")
                .unwrap_or_default()
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        };

        let delegate = DelegateConfig {
            manager_endpoint: env::var("MANAGER_ENDPOINT").unwrap_or_default(),
            secret: env::var("DELEGATE_SECRET").unwrap_or_default(),
            account_id: env::var("ACCOUNT_ID").unwrap_or_default(),
            max_builds: match env::var("DELEGATE_CAPACITY") {
                Ok(value) => value.trim().parse()?,
                Err(_) => 0,
            },
        };

        Ok(Config {
            debug: env_bool("DRONE_DEBUG", false),
            trace: env_bool("DRONE_TRACE", false),
            server_name: env_or("SERVER_NAME", "drone"),
            server,
            runner,
            delegate,
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_service_contract() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.server.bind, ":3000");
        assert_eq!(config.server_name, "drone");
        assert!(config.server.insecure);
        assert!(!config.server.skip_prepare_server);
    }

    #[test]
    fn mount_volumes_split_on_semicolons() {
        env::set_var("CI_MOUNT_VOLUMES", "/src:/dest; /other:/mnt ;");
        let config = Config::from_env().unwrap();
        env::remove_var("CI_MOUNT_VOLUMES");
        assert_eq!(config.runner.volumes, vec!["/src:/dest", "/other:/mnt"]);
    }
}
