use std::net::{IpAddr, SocketAddr};
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use uuid::Uuid;

/// The opaque identity of one logical datagram source. Several sources can share a single
///  socket address (multicast: many senders, one group address), so liveness and reassembly
///  state is keyed by this id rather than by the UDP sender address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SourceId(Uuid);

impl SourceId {
    pub const SERIALIZED_LEN: usize = 16;

    pub fn new_random() -> SourceId {
        SourceId(Uuid::new_v4())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.0.as_bytes());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SourceId> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("incomplete source id");
        }
        let mut bytes = [0u8; Self::SERIALIZED_LEN];
        buf.copy_to_slice(&mut bytes);
        Ok(SourceId(Uuid::from_bytes(bytes)))
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DatagramFlags: u8 {
        /// no-op liveness signal: the datagram carries no payload and is consumed by the
        ///  transport itself rather than dispatched as a command
        const KEEP_ALIVE = 0b0000_0001;
    }
}

/// The fixed header prefixed to every datagram - all numbers in network byte order (BE):
/// ```ascii
/// 0:  flags (u8)
/// 1:  source id (16 bytes)
/// 17: sequence number (u32) - strictly increasing per source, one per logical command
/// 21: fragment index (u16)
/// 23: fragment count (u16) - a non-fragmented command has index 0, count 1
/// 25: reply-to tag (u8): 0 none, 4 IP V4, 6 IP V6
/// 26: reply-to address (4+2 or 16+2 bytes if present) - where unicast replies should be
///      addressed, needed for multicast where the group address is not a valid return address.
///      An unspecified reply-to IP means 'the datagram's UDP source IP, at this port'.
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatagramHeader {
    pub flags: DatagramFlags,
    pub source_id: SourceId,
    pub sequence_number: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub reply_to: Option<SocketAddr>,
}

impl DatagramHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags.bits());
        self.source_id.ser(buf);
        buf.put_u32(self.sequence_number);
        buf.put_u16(self.fragment_index);
        buf.put_u16(self.fragment_count);
        match self.reply_to {
            None => buf.put_u8(0),
            Some(SocketAddr::V4(addr)) => {
                buf.put_u8(4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Some(SocketAddr::V6(addr)) => {
                buf.put_u8(6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
        }
    }

    /// Parse a header from the start of a received datagram. On success, `buf` points to the
    ///  start of the payload. A malformed or truncated header is an `Err` that the caller
    ///  treats as 'drop this datagram', never as a fatal condition.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DatagramHeader> {
        let flags = match DatagramFlags::from_bits(buf.try_get_u8()?) {
            Some(flags) => flags,
            None => bail!("unknown flag bits in datagram header"),
        };
        let source_id = SourceId::deser(buf)?;
        let sequence_number = buf.try_get_u32()?;
        let fragment_index = buf.try_get_u16()?;
        let fragment_count = buf.try_get_u16()?;

        let reply_to = match buf.try_get_u8()? {
            0 => None,
            4 => {
                if buf.remaining() < 4 + 2 {
                    bail!("incomplete V4 reply-to address");
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                let port = buf.try_get_u16()?;
                Some(SocketAddr::new(IpAddr::from(octets), port))
            }
            6 => {
                if buf.remaining() < 16 + 2 {
                    bail!("incomplete V6 reply-to address");
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                let port = buf.try_get_u16()?;
                Some(SocketAddr::new(IpAddr::from(octets), port))
            }
            tag => bail!("invalid reply-to tag {} in datagram header", tag),
        };

        Ok(DatagramHeader {
            flags,
            source_id,
            sequence_number,
            fragment_index,
            fragment_count,
            reply_to,
        })
    }

    pub fn serialized_len(reply_to: Option<SocketAddr>) -> usize {
        let reply_to_len = match reply_to {
            None => 0,
            Some(SocketAddr::V4(_)) => 4 + 2,
            Some(SocketAddr::V6(_)) => 16 + 2,
        };

        size_of::<u8>()                // flags
            + SourceId::SERIALIZED_LEN
            + size_of::<u32>()         // sequence number
            + 2 * size_of::<u16>()     // fragment index / count
            + size_of::<u8>()          // reply-to tag
            + reply_to_len
    }
}

/// Writes and reads the datagram header on behalf of a channel. The marshaller carries the
///  channel's own source id and - for the multicast variant - the advertised reply address
///  embedded into every outgoing header so that peers can reply via unicast.
pub struct DatagramHeaderMarshaller {
    source_id: SourceId,
    reply_to: Option<SocketAddr>,
}

impl DatagramHeaderMarshaller {
    /// unicast variant: the UDP sender address is a valid return address, so none is embedded
    pub fn new(source_id: SourceId) -> DatagramHeaderMarshaller {
        DatagramHeaderMarshaller {
            source_id,
            reply_to: None,
        }
    }

    /// multicast variant: outgoing headers advertise `reply_to` as the address for unicast
    ///  replies. An unspecified IP is filled in by the receiver from the UDP source address.
    pub fn with_reply_to(source_id: SourceId, reply_to: SocketAddr) -> DatagramHeaderMarshaller {
        DatagramHeaderMarshaller {
            source_id,
            reply_to: Some(reply_to),
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    /// the per-datagram framing overhead of this marshaller's headers
    pub fn serialized_len(&self) -> usize {
        DatagramHeader::serialized_len(self.reply_to)
    }

    pub fn write_header(
        &self,
        flags: DatagramFlags,
        sequence_number: u32,
        fragment_index: u16,
        fragment_count: u16,
        buf: &mut impl BufMut,
    ) {
        DatagramHeader {
            flags,
            source_id: self.source_id,
            sequence_number,
            fragment_index,
            fragment_count,
            reply_to: self.reply_to,
        }.ser(buf);
    }

    pub fn read_header(&self, buf: &mut impl Buf) -> anyhow::Result<DatagramHeader> {
        DatagramHeader::deser(buf)
    }
}
