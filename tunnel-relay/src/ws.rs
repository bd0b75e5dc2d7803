// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Virtual WebSocket server adapter.
//!
//! Each `ws_client_connect` becomes a [`VirtualSocket`] handed to the host
//! application. Inbound messages for one connection are delivered in
//! submission order; across connections only control-socket FIFO holds.

use tokio::sync::mpsc;
use tunnel_proto::{Message, WsData, WsEventType};

/// Close code used when the control socket goes away under a
/// sub-connection.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code reported after a host application error.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Parameters of a tunneled WebSocket connect.
#[derive(Debug, Clone)]
pub struct WsConnect {
    pub connection_id: u64,
    pub url: String,
    pub protocols: Option<Vec<String>>,
}

/// An event delivered to the host application for one sub-connection.
#[derive(Debug, Clone, PartialEq)]
pub enum WsIncoming {
    Message(WsData),
    Closed { code: u16, reason: String },
}

/// The host application's handle on one tunneled WebSocket.
pub struct VirtualSocket {
    connection_id: u64,
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<WsIncoming>,
    closed: bool,
}

impl VirtualSocket {
    pub(crate) fn new(
        connection_id: u64,
        outbound: mpsc::Sender<Message>,
        inbound: mpsc::Receiver<WsIncoming>,
    ) -> Self {
        Self {
            connection_id,
            outbound,
            inbound,
            closed: false,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Send a message to the peer, preserving text/binary typing.
    pub async fn send(&self, data: WsData) -> anyhow::Result<()> {
        if self.closed {
            anyhow::bail!("connection {} is closed", self.connection_id);
        }
        self.outbound
            .send(Message::WsMessage {
                connection_id: self.connection_id,
                data,
            })
            .await
            .map_err(|_| anyhow::anyhow!("control socket closed"))
    }

    /// The next message or close event. `None` means the control socket is
    /// gone and no close event could be delivered.
    pub async fn recv(&mut self) -> Option<WsIncoming> {
        let incoming = self.inbound.recv().await;
        if matches!(incoming, Some(WsIncoming::Closed { .. }) | None) {
            self.closed = true;
        }
        incoming
    }

    /// Close the sub-connection towards the peer.
    pub async fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self
            .outbound
            .send(close_event(self.connection_id, code, Some(reason.to_string())))
            .await;
    }
}

pub(crate) fn close_event(connection_id: u64, code: u16, reason: Option<String>) -> Message {
    Message::WsEvent {
        connection_id,
        event_type: WsEventType::Close,
        code: Some(code),
        reason,
        error: None,
    }
}

pub(crate) fn open_event(connection_id: u64) -> Message {
    Message::WsEvent {
        connection_id,
        event_type: WsEventType::Open,
        code: None,
        reason: None,
        error: None,
    }
}

pub(crate) fn error_event(connection_id: u64, error: String) -> Message {
    Message::WsEvent {
        connection_id,
        event_type: WsEventType::Error,
        code: None,
        reason: None,
        error: Some(error),
    }
}
