// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Per-control-socket session loop.
//!
//! Frame handling for one socket is serialized here: the loop decodes one
//! envelope at a time and routes by type. A symmetric key is installed at
//! most once; later `client_kx` frames are ignored and plaintext inner
//! messages are dropped. A decrypt failure closes the socket.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use tunnel_proto::{
    decode_frame, encode_frame, Frame, Message, SessionCrypto, WsEventType,
};

use crate::http::{self, HostApp};
use crate::identity::RelayIdentity;
use crate::ws::{self, VirtualSocket, WsConnect, WsIncoming};

const OUTBOUND_BUFFER: usize = 64;
const CONNECTION_BUFFER: usize = 64;

struct ConnEntry {
    sender: mpsc::Sender<WsIncoming>,
}

pub(crate) async fn run<A: HostApp>(
    stream: WebSocketStream<TcpStream>,
    identity: Arc<RelayIdentity>,
    app: Arc<A>,
) -> Result<()> {
    let (mut sink, mut stream) = stream.split();

    let hello = Frame::ServerKx {
        x25519_public_key: identity.public_key_bytes().to_vec(),
        quote: identity.quote.clone(),
    };
    sink.send(WsFrame::Binary(encode_frame(&hello)?))
        .await
        .context("failed to send server_kx")?;

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    let mut crypto: Option<Arc<SessionCrypto>> = None;
    let mut conns: HashMap<u64, ConnEntry> = HashMap::new();
    let mut tasks = JoinSet::new();

    let result: Result<()> = loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                // out_tx is held in scope, so recv never yields None here.
                let Some(message) = outgoing else { break Ok(()) };
                if let Message::WsEvent { connection_id, event_type: WsEventType::Close, .. } = &message {
                    if conns.remove(connection_id).is_none() {
                        // Already reclaimed; drop the duplicate close.
                        continue;
                    }
                }
                let Some(crypto) = &crypto else {
                    debug!("dropping outbound message before key install");
                    continue;
                };
                let frame = match crypto.seal(&message) {
                    Ok(frame) => frame,
                    Err(error) => break Err(error.into()),
                };
                let bytes = match encode_frame(&frame) {
                    Ok(bytes) => bytes,
                    Err(error) => break Err(error.into()),
                };
                if let Err(error) = sink.send(WsFrame::Binary(bytes)).await {
                    break Err(error.into());
                }
            }
            incoming = stream.next() => {
                let Some(incoming) = incoming else { break Ok(()) };
                let frame = match incoming {
                    Ok(WsFrame::Binary(bytes)) => bytes,
                    Ok(WsFrame::Close(_)) => break Ok(()),
                    Ok(WsFrame::Ping(_)) | Ok(WsFrame::Pong(_)) => continue,
                    Ok(other) => {
                        debug!("dropping non-binary frame: {other:?}");
                        continue;
                    }
                    Err(error) => break Err(error.into()),
                };
                let frame = match decode_frame(&frame) {
                    Ok(frame) => frame,
                    Err(error) => {
                        debug!("dropping undecodable frame: {error}");
                        continue;
                    }
                };
                match frame {
                    Frame::ClientKx { sealed_symmetric_key } => {
                        if crypto.is_some() {
                            debug!("ignoring duplicate client_kx");
                            continue;
                        }
                        match identity.open_sealed_key(&sealed_symmetric_key) {
                            Ok(key) => {
                                crypto = Some(Arc::new(SessionCrypto::new(&key)));
                                debug!("session key installed");
                            }
                            Err(error) => break Err(error).context("failed to open sealed session key"),
                        }
                    }
                    Frame::Enc { nonce, ciphertext } => {
                        let Some(crypto) = &crypto else {
                            debug!("dropping encrypted frame before key install");
                            continue;
                        };
                        let message = match crypto.open(&nonce, &ciphertext) {
                            Ok(message) => message,
                            // Decrypt failures are per-socket fatal.
                            Err(error) => break Err(error).context("envelope decrypt failed"),
                        };
                        if let Err(error) = route_message(
                            message,
                            crypto,
                            &mut sink,
                            &out_tx,
                            &mut conns,
                            &app,
                            &mut tasks,
                        )
                        .await
                        {
                            break Err(error);
                        }
                    }
                    Frame::ServerKx { .. } => {
                        debug!("dropping unexpected server_kx from peer");
                    }
                }
            }
        }
    };

    // Teardown: flush every sub-connection with an abnormal close. HTTP
    // tasks abort when the JoinSet drops.
    for (connection_id, entry) in conns.drain() {
        let _ = entry.sender.try_send(WsIncoming::Closed {
            code: ws::CLOSE_ABNORMAL,
            reason: String::new(),
        });
        debug!(connection_id, "sub-connection flushed on session close");
    }
    drop(tasks);

    if let Err(error) = &result {
        warn!("session closed with error: {error:#}");
    }
    result
}

type Sink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, WsFrame>;

async fn route_message<A: HostApp>(
    message: Message,
    crypto: &Arc<SessionCrypto>,
    sink: &mut Sink,
    out_tx: &mpsc::Sender<Message>,
    conns: &mut HashMap<u64, ConnEntry>,
    app: &Arc<A>,
    tasks: &mut JoinSet<()>,
) -> Result<()> {
    match message {
        Message::HttpRequest(request) => {
            let app = app.clone();
            let out_tx = out_tx.clone();
            tasks.spawn(async move {
                let response = http::dispatch(app, request).await;
                let _ = out_tx.send(Message::HttpResponse(response)).await;
            });
        }
        Message::WsClientConnect {
            connection_id,
            url,
            protocols,
        } => {
            if conns.contains_key(&connection_id) {
                debug!(connection_id, "duplicate ws connect ignored");
                return Ok(());
            }
            let (in_tx, in_rx) = mpsc::channel(CONNECTION_BUFFER);
            conns.insert(connection_id, ConnEntry { sender: in_tx });
            let socket = VirtualSocket::new(connection_id, out_tx.clone(), in_rx);
            let connect = WsConnect {
                connection_id,
                url,
                protocols,
            };
            let app = app.clone();
            let out_tx = out_tx.clone();
            tasks.spawn(async move {
                let _ = out_tx.send(ws::open_event(connection_id)).await;
                match app.accept_ws(connect, socket).await {
                    Ok(()) => {
                        let _ = out_tx
                            .send(ws::close_event(connection_id, ws::CLOSE_NORMAL, None))
                            .await;
                    }
                    Err(error) => {
                        warn!(connection_id, "ws handler error: {error:#}");
                        let _ = out_tx
                            .send(ws::error_event(connection_id, error.to_string()))
                            .await;
                        let _ = out_tx
                            .send(ws::close_event(
                                connection_id,
                                ws::CLOSE_INTERNAL_ERROR,
                                None,
                            ))
                            .await;
                    }
                }
            });
        }
        Message::WsMessage {
            connection_id,
            data,
        } => {
            if let Some(entry) = conns.get(&connection_id) {
                if entry.sender.send(WsIncoming::Message(data)).await.is_err() {
                    debug!(connection_id, "handler gone; dropping message");
                }
            } else {
                debug!(connection_id, "message for closed connection dropped");
            }
        }
        Message::WsClientClose {
            connection_id,
            code,
            reason,
        } => {
            let Some(entry) = conns.remove(&connection_id) else {
                debug!(connection_id, "close for unknown connection dropped");
                return Ok(());
            };
            let code = code.unwrap_or(ws::CLOSE_NORMAL);
            let reason = reason.unwrap_or_default();
            let _ = entry
                .sender
                .send(WsIncoming::Closed {
                    code,
                    reason: reason.clone(),
                })
                .await;
            // Confirm reclamation towards the client.
            let confirm = ws::close_event(connection_id, code, Some(reason));
            let frame = crypto.seal(&confirm)?;
            sink.send(WsFrame::Binary(encode_frame(&frame)?))
                .await
                .context("failed to confirm close")?;
        }
        Message::HttpResponse(_) | Message::WsEvent { .. } => {
            debug!("dropping inner message type not valid client-to-relay");
        }
    }
    Ok(())
}
