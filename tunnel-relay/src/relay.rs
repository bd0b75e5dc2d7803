// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! WebSocket listener: accepts upgrades on the tunnel path only.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info};

use crate::http::HostApp;
use crate::identity::RelayIdentity;
use crate::session;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upgrade path served by the relay. Anything else is refused.
    pub path: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            path: tunnel_proto::RELAY_PATH.to_string(),
        }
    }
}

/// The tunnel relay: one attested identity, one host application, many
/// control sockets.
pub struct Relay<A> {
    identity: Arc<RelayIdentity>,
    app: Arc<A>,
    config: RelayConfig,
}

impl<A: HostApp> Relay<A> {
    pub fn new(identity: RelayIdentity, app: A) -> Self {
        Self::with_config(identity, app, RelayConfig::default())
    }

    pub fn with_config(identity: RelayIdentity, app: A, config: RelayConfig) -> Self {
        Self {
            identity: Arc::new(identity),
            app: Arc::new(app),
            config,
        }
    }

    /// Accept control sockets until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr().context("no local addr")?;
        info!("relay listening on {local_addr}{}", self.config.path);
        loop {
            let (stream, peer) = listener.accept().await.context("accept failed")?;
            let identity = self.identity.clone();
            let app = self.app.clone();
            let path = self.config.path.clone();
            tokio::spawn(async move {
                if let Err(error) = handle_connection(stream, path, identity, app).await {
                    debug!("connection from {peer} ended: {error:#}");
                }
            });
        }
    }
}

async fn handle_connection<A: HostApp>(
    stream: TcpStream,
    path: String,
    identity: Arc<RelayIdentity>,
    app: Arc<A>,
) -> Result<()> {
    let callback = |request: &Request, response: Response| {
        if request.uri().path() != path {
            debug!("refusing upgrade on {}", request.uri().path());
            let mut refusal = ErrorResponse::new(Some("no such endpoint".to_string()));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            return Err(refusal);
        }
        Ok(response)
    };
    let ws = accept_hdr_async(stream, callback)
        .await
        .context("websocket upgrade failed")?;
    session::run(ws, identity, app).await
}
