//! HTTPS server bootstrap: mTLS by default, plain HTTP in insecure mode
//! for local development.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use stagehand_runtime::StageRegistry;

use crate::api::{self, AppState};
use crate::config::Config;
use crate::tls;

pub async fn start(config: Config, registry: Arc<StageRegistry>) -> anyhow::Result<()> {
    let addr = parse_bind(&config.server.bind)?;
    let server = config.server.clone();
    let state = AppState {
        config: Arc::new(config),
        registry,
    };
    let app = api::create_router(state);

    if server.insecure {
        warn!("RUNNING IN INSECURE MODE");
        info!(%addr, "server listening");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind {addr}"))?;
        axum::serve(listener, app).await?;
    } else {
        let rustls = tls::server_config(
            &server.cert_file,
            &server.key_file,
            &server.ca_cert_file,
        )
        .context("could not load TLS material")?;
        info!(%addr, "server listening with mTLS");
        axum_server::bind_rustls(addr, rustls)
            .serve(app.into_make_service())
            .await?;
    }
    Ok(())
}

/// Accepts `:3000` (all interfaces) as well as full `host:port` forms.
fn parse_bind(bind: &str) -> anyhow::Result<SocketAddr> {
    let normalized = if bind.starts_with(':') {
        format!("0.0.0.0{bind}")
    } else {
        bind.to_string()
    };
    normalized
        .parse()
        .with_context(|| format!("invalid bind address {bind}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_binds_all_interfaces() {
        let addr = parse_bind(":3000").unwrap();
        assert_eq!(addr.port(), 3000);
        assert!(addr.ip().is_unspecified());
    }

    #[test]
    fn explicit_host_is_preserved() {
        let addr = parse_bind("127.0.0.1:8080").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn garbage_binds_are_rejected() {
        assert!(parse_bind("not-an-addr").is_err());
    }
}
