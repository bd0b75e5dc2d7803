// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Client-side virtual WebSocket objects.
//!
//! A [`VirtualWebSocket`] walks the usual state machine: CONNECTING until
//! the relay reports `open`, OPEN while messages flow, CLOSING after a
//! local close, CLOSED once the relay confirms or the tunnel drops. Events
//! for one connection arrive in submission order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;
use tunnel_proto::{Message, WsData};

use crate::error::TunnelError;
use crate::tunnel::Shared;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// An event observed on a virtual WebSocket.
#[derive(Debug, Clone, PartialEq)]
pub enum WsIncoming {
    Open,
    Message(WsData),
    Error(String),
    Closed { code: u16, reason: String },
}

/// A WebSocket simulated over the tunnel.
pub struct VirtualWebSocket {
    connection_id: u64,
    shared: Arc<Shared>,
    events: mpsc::Receiver<WsIncoming>,
    state: WsState,
}

impl VirtualWebSocket {
    pub(crate) fn new(
        connection_id: u64,
        shared: Arc<Shared>,
        events: mpsc::Receiver<WsIncoming>,
    ) -> Self {
        Self {
            connection_id,
            shared,
            events,
            state: WsState::Connecting,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn state(&self) -> WsState {
        self.state
    }

    /// The next event for this connection. `None` once the connection is
    /// closed and drained.
    pub async fn next_event(&mut self) -> Option<WsIncoming> {
        if self.state == WsState::Closed {
            return None;
        }
        match self.events.recv().await {
            Some(event) => {
                match &event {
                    WsIncoming::Open => {
                        if self.state == WsState::Connecting {
                            self.state = WsState::Open;
                        }
                    }
                    WsIncoming::Closed { .. } => self.state = WsState::Closed,
                    _ => {}
                }
                Some(event)
            }
            None => {
                self.state = WsState::Closed;
                None
            }
        }
    }

    /// Send a message; only legal while the connection is OPEN.
    pub async fn send(&self, data: WsData) -> Result<(), TunnelError> {
        if self.state != WsState::Open {
            return Err(TunnelError::Protocol(format!(
                "connection {} is not open",
                self.connection_id
            )));
        }
        let Some(out_tx) = self.shared.out_tx() else {
            return Err(TunnelError::Disconnected);
        };
        out_tx
            .send(Message::WsMessage {
                connection_id: self.connection_id,
                data,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)
    }

    /// Request closure of the sub-connection. The state moves to CLOSING
    /// until the relay confirms with a close event.
    pub async fn close(&mut self, code: Option<u16>, reason: Option<String>) {
        if matches!(self.state, WsState::Closing | WsState::Closed) {
            return;
        }
        self.state = WsState::Closing;
        let Some(out_tx) = self.shared.out_tx() else {
            self.state = WsState::Closed;
            return;
        };
        let message = Message::WsClientClose {
            connection_id: self.connection_id,
            code,
            reason,
        };
        if out_tx.send(message).await.is_err() {
            debug!(
                connection_id = self.connection_id,
                "close lost: tunnel disconnected"
            );
            self.state = WsState::Closed;
        }
    }
}

impl Drop for VirtualWebSocket {
    fn drop(&mut self) {
        self.shared.drop_ws_conn(self.connection_id);
    }
}
