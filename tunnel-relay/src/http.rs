// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Virtual HTTP adapter: marshals tunneled requests into the host
//! application and captures its responses.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tracing::warn;
use tunnel_proto::{HttpRequest, HttpResponse};

use crate::ws::{VirtualSocket, WsConnect};

/// A request as seen by the host application.
///
/// The body is a string; binary bodies arrive base64-encoded.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// A response produced by the host application.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, status_text: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            headers: vec![],
            body: body.into(),
        }
    }

    /// A 200 response carrying a JSON body.
    pub fn json(value: &impl serde::Serialize) -> Result<Self> {
        let body = serde_json::to_string(value)?;
        Ok(Self {
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body,
        })
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found", "")
    }
}

/// The host application served through the tunnel.
pub trait HostApp: Send + Sync + 'static {
    /// Handle one tunneled HTTP request.
    fn handle_http(&self, request: Request) -> impl Future<Output = Result<Response>> + Send;

    /// Drive one tunneled WebSocket sub-connection. The future runs for
    /// the lifetime of the sub-connection; returning reclaims it.
    fn accept_ws(
        &self,
        connect: WsConnect,
        socket: VirtualSocket,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Run one request through the host application and build the wire
/// response. Application failures map to status 500 with `error` set; the
/// error detail stays at one message string.
pub(crate) async fn dispatch<A: HostApp>(app: Arc<A>, request: HttpRequest) -> HttpResponse {
    let request_id = request.request_id;
    let app_request = Request {
        method: request.method,
        url: request.url,
        headers: request.headers,
        body: request.body,
    };
    match app.handle_http(app_request).await {
        Ok(response) => HttpResponse {
            request_id,
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
            body: response.body,
            error: None,
        },
        Err(error) => {
            warn!("host application error: {error:#}");
            HttpResponse {
                request_id,
                status: 500,
                status_text: "Internal Server Error".to_string(),
                headers: vec![],
                body: String::new(),
                error: Some(error.to_string()),
            }
        }
    }
}
