//! Shared helpers for the crate's tests: a trivial wire format treating commands as raw byte
//!  vectors, a listener that records events into a channel for assertions, and local port
//!  reservation for wiring up socket pairs.

use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::sync::mpsc;
use crate::listener::TransportListener;
use crate::wire_format::WireFormat;

/// commands are opaque byte vectors, encoded as-is
pub struct TestWireFormat;

impl WireFormat for TestWireFormat {
    type Command = Vec<u8>;

    fn encode(&self, command: &Vec<u8>, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_slice(command);
        Ok(())
    }

    fn decode(&self, raw: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(raw.to_vec())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ListenerEvent {
    Command { from: SocketAddr, command: Vec<u8> },
    PeerDisconnected(SocketAddr),
    TransportError(String),
}

pub struct RecordingListener {
    sender: mpsc::UnboundedSender<ListenerEvent>,
}

impl RecordingListener {
    pub fn new() -> (Arc<RecordingListener>, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(RecordingListener { sender }), receiver)
    }
}

#[async_trait]
impl TransportListener<Vec<u8>> for RecordingListener {
    async fn on_command(&self, from: SocketAddr, command: Vec<u8>) {
        self.sender.send(ListenerEvent::Command { from, command }).ok();
    }

    async fn on_peer_disconnected(&self, peer: SocketAddr) {
        self.sender.send(ListenerEvent::PeerDisconnected(peer)).ok();
    }

    async fn on_transport_error(&self, error: anyhow::Error) {
        self.sender.send(ListenerEvent::TransportError(error.to_string())).ok();
    }
}

/// Reserve a local UDP address by briefly binding an ephemeral port. There is a small race
///  window between release and reuse, which is acceptable for tests.
pub fn reserve_local_addr() -> SocketAddr {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0")
        .expect("binding an ephemeral local port");
    socket.local_addr().expect("bound socket has a local address")
}
