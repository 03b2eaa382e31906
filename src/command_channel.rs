use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use anyhow::bail;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::config::TransportConfig;
use crate::datagram_header::{DatagramFlags, DatagramHeaderMarshaller};
use crate::reassembly::ReassemblyTable;
use crate::wire_format::WireFormat;

/// What a channel's receive path yields: either a complete decoded command, or a keep-alive
///  that only refreshes the sender's liveness.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<C> {
    Command { from: SocketAddr, command: C },
    KeepAlive { from: SocketAddr },
}

impl<C> Inbound<C> {
    pub fn from(&self) -> SocketAddr {
        match self {
            Inbound::Command { from, .. } => *from,
            Inbound::KeepAlive { from } => *from,
        }
    }
}

/// The bidirectional channel over which commands travel as datagrams. Two concrete variants:
///  a connected unicast socket ([CommandDatagramChannel](crate::datagram_channel::CommandDatagramChannel))
///  and a multicast group socket ([CommandDatagramSocket](crate::datagram_socket::CommandDatagramSocket)).
///  Both share the framing/fragmentation logic in [DatagramFramer].
#[async_trait]
pub trait CommandChannel<W: WireFormat>: Send + Sync + 'static {
    /// Serialize and transmit one command, fragmenting it if its encoding exceeds one
    ///  datagram's payload capacity. All fragments are framed before the first is transmitted,
    ///  so a framing failure sends nothing. `None` sends to the channel's default destination
    ///  (the connected peer / the multicast group).
    async fn send(&self, command: &W::Command, destination: Option<SocketAddr>) -> anyhow::Result<()>;

    /// transmit a keep-alive datagram to the default destination
    async fn send_keep_alive(&self) -> anyhow::Result<()>;

    /// Read datagrams until a complete command (or keep-alive) is available or `timeout`
    ///  elapses. Malformed datagrams are dropped silently; an `Err` is an unrecoverable I/O
    ///  failure.
    async fn receive(&self, timeout: Duration) -> anyhow::Result<Option<Inbound<W::Command>>>;

    /// the address the most recently processed datagram originated from, for routing replies
    fn peer_address(&self) -> Option<SocketAddr>;

    fn local_address(&self) -> SocketAddr;

    /// Release socket/group resources. Best-effort: all errors are collected and returned
    ///  rather than aborting the teardown early.
    async fn close(&self) -> Vec<anyhow::Error>;
}

/// The I/O-independent half of a command channel: turns commands into headered datagram
///  buffers and received datagrams back into commands, reassembling fragments as needed.
pub struct DatagramFramer<W: WireFormat> {
    wire_format: Arc<W>,
    marshaller: DatagramHeaderMarshaller,
    buffer_pool: Arc<BufferPool>,
    /// next sequence number for this channel's own source id; shared by all concurrent senders
    sequence_number: AtomicU32,
    /// owned by the read loop at steady state; the lock exists because `Sync` is part of the
    ///  channel contract, not because senders touch it
    reassembly: Mutex<ReassemblyTable>,
    max_fragment_payload: usize,
    last_peer: Mutex<Option<SocketAddr>>,
}

impl<W: WireFormat> DatagramFramer<W> {
    pub fn new(
        wire_format: Arc<W>,
        marshaller: DatagramHeaderMarshaller,
        buffer_pool: Arc<BufferPool>,
        config: &TransportConfig,
    ) -> anyhow::Result<DatagramFramer<W>> {
        let header_len = marshaller.serialized_len();
        if config.datagram_size <= header_len {
            bail!("datagram size {} leaves no room for payload after the {} byte header", config.datagram_size, header_len);
        }

        Ok(DatagramFramer {
            wire_format,
            marshaller,
            buffer_pool,
            sequence_number: AtomicU32::new(0),
            reassembly: Mutex::new(ReassemblyTable::new(config.reassembly_timeout)),
            max_fragment_payload: config.datagram_size - header_len,
            last_peer: Mutex::new(None),
        })
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// Encode a command and split it into headered datagram buffers. Either all fragments are
    ///  produced or none: a failure releases everything built so far and sends nothing.
    pub fn frame_command(&self, command: &W::Command) -> anyhow::Result<Vec<FixedBuf>> {
        let mut encoded = BytesMut::new();
        self.wire_format.encode(command, &mut encoded)?;
        self.frame_payload(&encoded, DatagramFlags::empty())
    }

    pub fn frame_keep_alive(&self) -> anyhow::Result<Vec<FixedBuf>> {
        self.frame_payload(&[], DatagramFlags::KEEP_ALIVE)
    }

    fn frame_payload(&self, payload: &[u8], flags: DatagramFlags) -> anyhow::Result<Vec<FixedBuf>> {
        let fragment_count = payload.len().div_ceil(self.max_fragment_payload).max(1);
        if fragment_count > u16::MAX as usize {
            bail!("command of {} encoded bytes exceeds the maximum fragmentable size of {}", payload.len(), self.max_fragment_payload * u16::MAX as usize);
        }

        // one sequence number per logical command, shared by all its fragments
        let sequence_number = self.sequence_number.fetch_add(1, Ordering::AcqRel);

        let mut datagrams = Vec::with_capacity(fragment_count);
        for (fragment_index, chunk) in Self::chunks_with_at_least_one(payload, self.max_fragment_payload)
            .take(fragment_count)
            .enumerate()
        {
            let mut buf = match self.buffer_pool.lease() {
                Ok(buf) => buf,
                Err(e) => {
                    for buf in datagrams {
                        self.buffer_pool.release(buf);
                    }
                    return Err(e);
                }
            };
            self.marshaller.write_header(flags, sequence_number, fragment_index as u16, fragment_count as u16, &mut buf);
            buf.put_slice(chunk);
            datagrams.push(buf);
        }

        trace!("framed {} byte payload as {} datagram(s), sequence number {}", payload.len(), datagrams.len(), sequence_number);
        Ok(datagrams)
    }

    /// like `chunks()`, but an empty payload yields one empty chunk instead of none
    fn chunks_with_at_least_one<'a>(payload: &'a [u8], chunk_size: usize) -> impl Iterator<Item = &'a [u8]> {
        let empty: &[u8] = &[];
        payload.chunks(chunk_size)
            .chain(std::iter::once(empty))
    }

    pub fn release(&self, buf: FixedBuf) {
        self.buffer_pool.release(buf);
    }

    /// Process one raw received datagram. Returns `None` for anything that does not complete
    ///  a command: malformed headers, undecodable payloads, our own multicast traffic,
    ///  fragments still awaiting reassembly. None of these are errors to the caller.
    pub fn on_datagram(&self, raw: &[u8], udp_source: SocketAddr, now: Instant) -> Option<Inbound<W::Command>> {
        let parse_buf = &mut &raw[..];
        let header = match self.marshaller.read_header(parse_buf) {
            Ok(header) => header,
            Err(e) => {
                debug!("received datagram with unparsable header from {:?} - dropping: {}", udp_source, e);
                return None;
            }
        };

        if header.source_id == self.marshaller.source_id() {
            // our own multicast traffic, looped back
            trace!("dropping own datagram, sequence number {}", header.sequence_number);
            return None;
        }

        // The reply-to address wins over the UDP source: a multicast group address is not a
        //  valid return address. An unspecified reply-to IP advertises only a port, to be
        //  combined with the IP the datagram actually came from.
        let from = match header.reply_to {
            None => udp_source,
            Some(reply_to) if reply_to.ip().is_unspecified() => SocketAddr::new(udp_source.ip(), reply_to.port()),
            Some(reply_to) => reply_to,
        };
        *self.last_peer.lock().unwrap() = Some(from);

        if header.flags.contains(DatagramFlags::KEEP_ALIVE) {
            trace!("received keep-alive from {:?}", from);
            return Some(Inbound::KeepAlive { from });
        }

        let complete_payload = if header.fragment_count == 1 {
            if header.fragment_index != 0 {
                debug!("received single-fragment datagram with index {} - dropping", header.fragment_index);
                return None;
            }
            parse_buf.to_vec()
        }
        else {
            self.reassembly.lock().unwrap().on_fragment(&header, parse_buf, now)?
        };

        match self.wire_format.decode(&complete_payload) {
            Ok(command) => Some(Inbound::Command { from, command }),
            Err(e) => {
                warn!("received undecodable command from {:?} - dropping: {}", from, e);
                None
            }
        }
    }

    /// bounds reassembly memory under fragment loss; called by channels on receive timeouts
    ///  and between datagrams
    pub fn purge_stale(&self, now: Instant) {
        self.reassembly.lock().unwrap().purge_stale(now);
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        *self.last_peer.lock().unwrap()
    }
}
