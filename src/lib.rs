//! A datagram transport for broker commands, carrying a pluggable wire format over plain UDP
//!  or IP multicast.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *commands* (i.e. defined-length chunks of data as
//!   opposed to streams of bytes) - serialization is delegated to a [wire_format::WireFormat]
//!   implementation, the transport only frames its output into datagrams
//! * Datagram semantics are passed through rather than papered over: delivery is unreliable
//!   and unordered, and making it reliable is the responsibility of layers above this one
//!   * the one concession is fragment reassembly - commands bigger than a datagram are split
//!     across datagrams and reassembled on arrival, with incomplete commands silently timing
//!     out
//!   * configured datagram size since path MTU discovery does not work reliably
//! * Two flavors behind the same API, selected by URI scheme:
//!   * `udp://host:port` - a socket connected to a single peer
//!   * `multicast://group:port` - an unconnected socket joined to a group, where every group
//!     member is a potential peer and replies go back via a reply address embedded in the
//!     datagram header
//! * Peer liveness through keep-alive datagrams: silent peers are reported as disconnected,
//!   exactly once per disconnect
//! * Receive buffers come from a bounded pool to keep steady-state operation allocation-free
//!
//! ## Datagram layout
//!
//! Every datagram starts with a fixed header written by
//!  [datagram_header::DatagramHeaderMarshaller]:
//!
//! ```text
//! +-------+-----------+---------+----------+----------+----------------------+---------+
//! | flags | source id | seq nr  | frag idx | frag cnt | reply-to             | payload |
//! | 1     | 16        | 4       | 2        | 2        | 1 (+4/16 IP +2 port) | ...     |
//! +-------+-----------+---------+----------+----------+----------------------+---------+
//! ```
//!
//! All fragments of one command share its sequence number; the source id makes sequence
//!  numbers from different senders disjoint and lets a multicast sender recognize (and drop)
//!  its own looped-back traffic.

pub mod buffers;
pub mod command_channel;
pub mod config;
pub mod datagram_channel;
pub mod datagram_header;
pub mod datagram_socket;
pub mod listener;
pub mod multicast;
mod reassembly;
pub mod transport;
pub mod uri;
pub mod wire_format;

#[cfg(test)]
mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
