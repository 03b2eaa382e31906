use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

/// The broker-side consumer of a transport, injected at construction time.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportListener<C: Send + Sync + 'static>: Send + Sync + 'static {
    /// a complete command arrived from `from` (the peer's reply address, not necessarily the
    ///  raw UDP source for multicast traffic)
    async fn on_command(&self, from: SocketAddr, command: C);

    /// no traffic arrived from `peer` within the liveness window; fired exactly once per
    ///  silent peer, not repeated every poll cycle
    async fn on_peer_disconnected(&self, peer: SocketAddr);

    /// an unrecoverable I/O failure stopped the transport
    async fn on_transport_error(&self, error: anyhow::Error);
}
