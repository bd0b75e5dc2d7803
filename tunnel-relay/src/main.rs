// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Tunnel relay daemon.
//!
//! Serves a minimal status application over the attested tunnel. Inside a
//! TD the attestation quote comes from the kernel; for development a
//! pre-generated quote can be loaded from a file.

use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tunnel_relay::{
    HostApp, QuoteSource, Relay, RelayIdentity, Request, Response, StaticQuoteSource,
    TdxQuoteSource, VirtualSocket, WsConnect, WsIncoming,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address for the relay.
    #[arg(short, long, env = "RELAY_LISTEN", default_value = "0.0.0.0:8443")]
    listen: String,

    /// Development only: serve a pre-generated quote from this file
    /// instead of the TDX guest device.
    #[arg(long, env = "RELAY_QUOTE_FILE")]
    quote_file: Option<String>,
}

/// Built-in status application.
struct StatusApp {
    started: Instant,
}

impl StatusApp {
    fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    fn format_uptime(&self) -> String {
        let secs = self.started.elapsed().as_secs();
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

impl HostApp for StatusApp {
    async fn handle_http(&self, request: Request) -> Result<Response> {
        match (request.method.as_str(), request.url.as_str()) {
            ("GET", "/uptime") => Response::json(&serde_json::json!({
                "uptime": { "formatted": self.format_uptime() }
            })),
            _ => Ok(Response::not_found()),
        }
    }

    async fn accept_ws(&self, _connect: WsConnect, mut socket: VirtualSocket) -> Result<()> {
        // Echo service preserving text/binary typing.
        while let Some(incoming) = socket.recv().await {
            match incoming {
                WsIncoming::Message(data) => socket.send(data).await?,
                WsIncoming::Closed { .. } => break,
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }
    let args = Args::parse();

    let quote_source: Box<dyn QuoteSource> = match &args.quote_file {
        Some(path) => {
            let quote = std::fs::read(path)
                .with_context(|| format!("failed to read quote file {path}"))?;
            Box::new(StaticQuoteSource(quote))
        }
        None => {
            match tdx_guest::vp_info() {
                Ok(vp) => {
                    info!(
                        "TD attributes={:#x} xfam={:#x} gpa_width={} migratable={}",
                        vp.attributes,
                        vp.xfam,
                        vp.gpa_width,
                        vp.migratable()
                    );
                }
                Err(error) => warn!("VP.INFO unavailable: {error}"),
            }
            Box::new(TdxQuoteSource)
        }
    };
    let identity = RelayIdentity::generate(quote_source.as_ref())?;

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    Relay::new(identity, StatusApp::new()).serve(listener).await
}
