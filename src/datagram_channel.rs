use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::Context;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, info};
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::command_channel::{CommandChannel, DatagramFramer, Inbound};
use crate::config::TransportConfig;
use crate::datagram_header::{DatagramHeaderMarshaller, SourceId};
use crate::wire_format::WireFormat;

/// The unicast [CommandChannel]: one datagram socket bound locally and connected to a single
///  remote peer. The UDP source address of inbound datagrams is a valid reply address, so no
///  reply-to is embedded in outgoing headers.
pub struct CommandDatagramChannel<W: WireFormat> {
    socket: UdpSocket,
    remote: SocketAddr,
    framer: DatagramFramer<W>,
}

impl<W: WireFormat> CommandDatagramChannel<W> {
    pub async fn connect(
        remote: SocketAddr,
        config: &TransportConfig,
        wire_format: Arc<W>,
        buffer_pool: Arc<BufferPool>,
        source_id: SourceId,
    ) -> anyhow::Result<CommandDatagramChannel<W>> {
        let bind_addr = config.bind_addr.unwrap_or_else(|| {
            if remote.is_ipv4() {
                "0.0.0.0:0".parse().expect("valid literal address")
            }
            else {
                "[::]:0".parse().expect("valid literal address")
            }
        });

        let socket = UdpSocket::bind(bind_addr).await
            .with_context(|| format!("binding datagram socket to {:?}", bind_addr))?;
        socket.connect(remote).await
            .with_context(|| format!("connecting datagram socket to {:?}", remote))?;
        info!("udp command channel {:?} -> {:?}", socket.local_addr()?, remote);

        let marshaller = DatagramHeaderMarshaller::new(source_id);
        let framer = DatagramFramer::new(wire_format, marshaller, buffer_pool, config)?;

        Ok(CommandDatagramChannel {
            socket,
            remote,
            framer,
        })
    }

    async fn transmit(&self, datagrams: Vec<FixedBuf>, destination: Option<SocketAddr>) -> anyhow::Result<()> {
        let mut result = Ok(());
        for datagram in datagrams {
            // once one fragment failed, the command cannot arrive anyway - skip the rest, but
            //  keep iterating so every buffer goes back to the pool
            if result.is_ok() {
                result = match destination {
                    None => self.socket.send(datagram.as_ref()).await.map(|_| ()),
                    Some(to) => self.socket.send_to(datagram.as_ref(), to).await.map(|_| ()),
                };
            }
            self.framer.release(datagram);
        }
        result.with_context(|| format!("sending datagram to {:?}", destination.unwrap_or(self.remote)))
    }
}

#[async_trait]
impl<W: WireFormat> CommandChannel<W> for CommandDatagramChannel<W> {
    async fn send(&self, command: &W::Command, destination: Option<SocketAddr>) -> anyhow::Result<()> {
        let datagrams = self.framer.frame_command(command)?;
        self.transmit(datagrams, destination).await
    }

    async fn send_keep_alive(&self) -> anyhow::Result<()> {
        let datagrams = self.framer.frame_keep_alive()?;
        self.transmit(datagrams, None).await
    }

    async fn receive(&self, timeout: Duration) -> anyhow::Result<Option<Inbound<W::Command>>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = self.framer.buffer_pool().lease()?;

        loop {
            buf.maximize_len();

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let received = match tokio::time::timeout(remaining, self.socket.recv(buf.as_mut())).await {
                Err(_elapsed) => {
                    self.framer.release(buf);
                    self.framer.purge_stale(Instant::now());
                    return Ok(None);
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    // ICMP port unreachable from the (absent) peer - not fatal for a datagram
                    //  medium, liveness tracking handles the dead peer
                    debug!("connection refused from {:?}", self.remote);
                    continue;
                }
                Ok(Err(e)) => {
                    self.framer.release(buf);
                    return Err(e).context("receiving datagram");
                }
                Ok(Ok(num_read)) => num_read,
            };

            buf.truncate(received);
            if let Some(inbound) = self.framer.on_datagram(buf.as_ref(), self.remote, Instant::now()) {
                self.framer.release(buf);
                return Ok(Some(inbound));
            }
        }
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        self.framer.peer_address().or(Some(self.remote))
    }

    fn local_address(&self) -> SocketAddr {
        self.socket.local_addr()
            .expect("bound socket has a local address")
    }

    async fn close(&self) -> Vec<anyhow::Error> {
        // nothing to tear down beyond dropping the socket
        Vec::new()
    }
}
