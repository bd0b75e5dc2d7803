// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Tunnel connection management, handshake and request multiplexing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use qvl::{Quote, VerifyOptions};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use tunnel_proto::{
    decode_frame, encode_frame, kx_report_data, seal_symmetric_key, Frame, HttpRequest,
    HttpResponse, Message, SessionCrypto, WsEventType,
};

use crate::error::TunnelError;
use crate::policy::TunnelPolicy;
use crate::ws::{VirtualWebSocket, WsIncoming};

/// Pending HTTP requests fail after this long.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const OUTBOUND_BUFFER: usize = 64;
const CONNECTION_BUFFER: usize = 64;

/// A request issued through [`Tunnel::fetch`].
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Body string; binary bodies are base64-encoded at this layer.
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: vec![],
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: vec![],
            body: Some(body.into()),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A response resolved by [`Tunnel::fetch`].
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) out_tx: Option<mpsc::Sender<Message>>,
    waiters: HashMap<u64, oneshot::Sender<HttpResponse>>,
    ws_conns: HashMap<u64, mpsc::Sender<WsIncoming>>,
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) state: Mutex<SessionState>,
    next_id: AtomicU64,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SessionState {
                out_tx: None,
                waiters: HashMap::new(),
                ws_conns: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn out_tx(&self) -> Option<mpsc::Sender<Message>> {
        self.state.lock().expect("poisoned").out_tx.clone()
    }

    pub(crate) fn drop_ws_conn(&self, connection_id: u64) {
        self.state
            .lock()
            .expect("poisoned")
            .ws_conns
            .remove(&connection_id);
    }

    /// Fail every pending waiter and sub-connection of the lost session.
    fn fail_all(&self) {
        let mut state = self.state.lock().expect("poisoned");
        state.out_tx = None;
        // Dropping the senders rejects the waiters with `Disconnected`.
        state.waiters.clear();
        for (_, conn) in state.ws_conns.drain() {
            let _ = conn.try_send(WsIncoming::Closed {
                code: 1006,
                reason: String::new(),
            });
        }
    }
}

struct Connection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    crypto: SessionCrypto,
}

/// A multiplexed, authenticated, end-to-end encrypted channel to an
/// attested relay.
pub struct Tunnel {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

impl Tunnel {
    /// Connect to `ws(s)://host/__ra__` and run the attested handshake.
    ///
    /// Handshake and policy failures surface here; later disconnects are
    /// handled by reconnecting internally.
    pub async fn connect(url: &str, policy: TunnelPolicy) -> Result<Self, TunnelError> {
        let connection = connect_once(url, &policy).await?;
        let shared = Arc::new(Shared::new());
        let driver = tokio::spawn(drive(
            url.to_string(),
            policy,
            shared.clone(),
            Some(connection),
        ));
        Ok(Self { shared, driver })
    }

    /// Issue a tunneled HTTP request and await its response.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TunnelError> {
        let request_id = self.shared.next_id();
        let (waiter_tx, waiter_rx) = oneshot::channel();
        let out_tx = {
            let mut state = self.shared.state.lock().expect("poisoned");
            let Some(out_tx) = state.out_tx.clone() else {
                return Err(TunnelError::Disconnected);
            };
            state.waiters.insert(request_id, waiter_tx);
            out_tx
        };
        let message = Message::HttpRequest(HttpRequest {
            request_id,
            method: request.method,
            url: request.url,
            headers: request.headers,
            body: request.body,
        });
        if out_tx.send(message).await.is_err() {
            self.remove_waiter(request_id);
            return Err(TunnelError::Disconnected);
        }
        // The timeout is a raced future, not a detached timer; nothing
        // here keeps the runtime alive on its own.
        match tokio::time::timeout(REQUEST_TIMEOUT, waiter_rx).await {
            Err(_elapsed) => {
                self.remove_waiter(request_id);
                Err(TunnelError::RequestTimeout)
            }
            Ok(Err(_dropped)) => Err(TunnelError::Disconnected),
            Ok(Ok(response)) => {
                if let Some(error) = response.error {
                    return Err(TunnelError::Application(error));
                }
                Ok(FetchResponse {
                    status: response.status,
                    status_text: response.status_text,
                    headers: response.headers,
                    body: response.body,
                })
            }
        }
    }

    /// Open a virtual WebSocket sub-connection through the tunnel.
    pub async fn open_websocket(
        &self,
        url: &str,
        protocols: Option<Vec<String>>,
    ) -> Result<VirtualWebSocket, TunnelError> {
        let connection_id = self.shared.next_id();
        let (event_tx, event_rx) = mpsc::channel(CONNECTION_BUFFER);
        let out_tx = {
            let mut state = self.shared.state.lock().expect("poisoned");
            let Some(out_tx) = state.out_tx.clone() else {
                return Err(TunnelError::Disconnected);
            };
            state.ws_conns.insert(connection_id, event_tx);
            out_tx
        };
        let message = Message::WsClientConnect {
            connection_id,
            url: url.to_string(),
            protocols,
        };
        if out_tx.send(message).await.is_err() {
            self.shared.drop_ws_conn(connection_id);
            return Err(TunnelError::Disconnected);
        }
        Ok(VirtualWebSocket::new(
            connection_id,
            self.shared.clone(),
            event_rx,
        ))
    }

    /// Close the tunnel: fail pending waiters and stop reconnecting.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.close_notify.notify_waiters();
        self.shared.fail_all();
    }

    fn remove_waiter(&self, request_id: u64) {
        self.shared
            .state
            .lock()
            .expect("poisoned")
            .waiters
            .remove(&request_id);
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
        self.driver.abort();
    }
}

/// Dial, receive `server_kx`, verify, and install a fresh session key.
async fn connect_once(url: &str, policy: &TunnelPolicy) -> Result<Connection, TunnelError> {
    let (mut ws, _response) = connect_async(url)
        .await
        .map_err(|e| TunnelError::Transport(e.to_string()))?;

    let frame = loop {
        let incoming = ws
            .next()
            .await
            .ok_or_else(|| TunnelError::Handshake("closed before server_kx".to_string()))?
            .map_err(|e| TunnelError::Transport(e.to_string()))?;
        match incoming {
            WsFrame::Binary(bytes) => break decode_frame(&bytes)?,
            WsFrame::Ping(_) | WsFrame::Pong(_) => continue,
            other => {
                return Err(TunnelError::Protocol(format!(
                    "unexpected frame during handshake: {other:?}"
                )))
            }
        }
    };
    let Frame::ServerKx {
        x25519_public_key,
        quote,
    } = frame
    else {
        return Err(TunnelError::Protocol(
            "expected server_kx as first frame".to_string(),
        ));
    };

    if policy.dev {
        debug!("dev policy: skipping quote verification");
    } else {
        verify_server(&quote, &x25519_public_key, policy)?;
    }

    let key = SessionCrypto::generate_key();
    let sealed = seal_symmetric_key(&key, &x25519_public_key)?;
    ws.send(WsFrame::Binary(encode_frame(&Frame::ClientKx {
        sealed_symmetric_key: sealed,
    })?))
    .await
    .map_err(|e| TunnelError::Transport(e.to_string()))?;

    Ok(Connection {
        ws,
        crypto: SessionCrypto::new(&key),
    })
}

/// Verify the relay's quote and its binding to the key-exchange key.
fn verify_server(
    quote_bytes: &[u8],
    server_public_key: &[u8],
    policy: &TunnelPolicy,
) -> Result<(), TunnelError> {
    let quote = Quote::parse(quote_bytes).map_err(qvl::VerifyError::from)?;

    let expected = kx_report_data(server_public_key);
    if quote.report.report_data() != &expected {
        return Err(TunnelError::Handshake(
            "quote report data does not bind the server key".to_string(),
        ));
    }

    let mut options = VerifyOptions::new(policy.evaluation_time())
        .pinned_roots(&policy.pinned_roots)
        .crls(&policy.crls);
    let tcb_hook = policy.verify_tcb.clone();
    let hook = move |fmspc: &str, quote: &Quote| match &tcb_hook {
        Some(verify_tcb) => verify_tcb(fmspc, quote),
        None => true,
    };
    options = options.verify_tcb(&hook);
    qvl::verify_parsed_quote(&quote, &options)?;

    match &policy.match_quote {
        Some(match_quote) if match_quote(&quote) => Ok(()),
        Some(_) => Err(TunnelError::PolicyRejected(
            "measurement predicate rejected the quote".to_string(),
        )),
        None => Err(TunnelError::PolicyRejected(
            "no measurement predicate configured".to_string(),
        )),
    }
}

/// Owns the control socket across reconnects.
async fn drive(
    url: String,
    policy: TunnelPolicy,
    shared: Arc<Shared>,
    mut first: Option<Connection>,
) {
    loop {
        let connection = match first.take() {
            Some(connection) => connection,
            None => match connect_once(&url, &policy).await {
                Ok(connection) => connection,
                Err(error) => {
                    warn!("reconnect failed: {error}");
                    if shared.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            },
        };

        run_connection(connection, &shared).await;
        shared.fail_all();

        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        debug!("reconnecting tunnel");
    }
}

async fn run_connection(connection: Connection, shared: &Arc<Shared>) {
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    shared.state.lock().expect("poisoned").out_tx = Some(out_tx);
    let (mut sink, mut stream) = connection.ws.split();
    let crypto = connection.crypto;

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                let Some(message) = outgoing else { break };
                let frame = match crypto.seal(&message) {
                    Ok(frame) => frame,
                    Err(error) => {
                        warn!("failed to seal message: {error}");
                        break;
                    }
                };
                let bytes = match encode_frame(&frame) {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        warn!("failed to encode frame: {error}");
                        break;
                    }
                };
                if sink.send(WsFrame::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                let Some(incoming) = incoming else { break };
                let bytes = match incoming {
                    Ok(WsFrame::Binary(bytes)) => bytes,
                    Ok(WsFrame::Close(_)) => break,
                    Ok(WsFrame::Ping(_)) | Ok(WsFrame::Pong(_)) => continue,
                    Ok(other) => {
                        debug!("dropping non-binary frame: {other:?}");
                        continue;
                    }
                    Err(error) => {
                        debug!("transport error: {error}");
                        break;
                    }
                };
                let frame = match decode_frame(&bytes) {
                    Ok(frame) => frame,
                    Err(error) => {
                        debug!("dropping undecodable frame: {error}");
                        continue;
                    }
                };
                let Frame::Enc { nonce, ciphertext } = frame else {
                    // Plaintext after the handshake is dropped.
                    debug!("dropping plaintext frame after handshake");
                    continue;
                };
                let message = match crypto.open(&nonce, &ciphertext) {
                    Ok(message) => message,
                    Err(error) => {
                        // Decrypt failures are per-socket fatal.
                        warn!("envelope decrypt failed: {error}");
                        break;
                    }
                };
                route_incoming(message, shared).await;
            }
            _ = shared.close_notify.notified() => {
                let _ = sink.send(WsFrame::Close(None)).await;
                break;
            }
        }
    }

    shared.state.lock().expect("poisoned").out_tx = None;
}

async fn route_incoming(message: Message, shared: &Arc<Shared>) {
    match message {
        Message::HttpResponse(response) => {
            let waiter = shared
                .state
                .lock()
                .expect("poisoned")
                .waiters
                .remove(&response.request_id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(response);
                }
                None => debug!(
                    request_id = response.request_id,
                    "response without waiter dropped"
                ),
            }
        }
        Message::WsEvent {
            connection_id,
            event_type,
            code,
            reason,
            error,
        } => {
            let incoming = match event_type {
                WsEventType::Open => WsIncoming::Open,
                WsEventType::Error => WsIncoming::Error(error.unwrap_or_default()),
                WsEventType::Close => WsIncoming::Closed {
                    code: code.unwrap_or(1005),
                    reason: reason.unwrap_or_default(),
                },
            };
            let is_close = matches!(incoming, WsIncoming::Closed { .. });
            let sender = {
                let mut state = shared.state.lock().expect("poisoned");
                if is_close {
                    state.ws_conns.remove(&connection_id)
                } else {
                    state.ws_conns.get(&connection_id).cloned()
                }
            };
            match sender {
                Some(sender) => {
                    let _ = sender.send(incoming).await;
                }
                None => debug!(connection_id, "event for unknown connection dropped"),
            }
        }
        Message::WsMessage {
            connection_id,
            data,
        } => {
            let sender = shared
                .state
                .lock()
                .expect("poisoned")
                .ws_conns
                .get(&connection_id)
                .cloned();
            match sender {
                Some(sender) => {
                    let _ = sender.send(WsIncoming::Message(data)).await;
                }
                None => debug!(connection_id, "message for unknown connection dropped"),
            }
        }
        Message::HttpRequest(_) | Message::WsClientConnect { .. } | Message::WsClientClose { .. } => {
            debug!("dropping inner message type not valid relay-to-client");
        }
    }
}
