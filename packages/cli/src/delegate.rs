//! One-shot capacity registration against the upstream manager, so the
//! orchestrator knows how many concurrent builds this host accepts.

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Serialize)]
struct CapacityBody<'a> {
    id: &'a str,
    max_builds: i64,
}

pub async fn register_capacity(config: &Config, instance_id: &str) {
    let delegate = &config.delegate;
    if delegate.manager_endpoint.is_empty() {
        return;
    }

    let url = format!(
        "{}/api/agent/delegates/capacity",
        delegate.manager_endpoint.trim_end_matches('/')
    );
    let body = CapacityBody {
        id: instance_id,
        max_builds: delegate.max_builds,
    };
    let result = reqwest::Client::new()
        .post(&url)
        .query(&[("accountId", delegate.account_id.as_str())])
        .header("X-Delegate-Token", &delegate.secret)
        .json(&body)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            info!(instance_id, max_builds = delegate.max_builds, "registered delegate capacity");
        }
        Ok(resp) => {
            warn!(status = %resp.status(), "delegate capacity registration was rejected");
        }
        Err(err) => {
            warn!(error = %err, "could not register delegate capacity");
        }
    }
}
