use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::buffers::buffer_pool::PoolExhaustionPolicy;
use crate::datagram_header::DatagramHeader;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// The maximum number of bytes per datagram, including the datagram header. Commands whose
    ///  encoding does not fit into one datagram's payload capacity are fragmented.
    ///
    /// In an ideal world, we would discover the path MTU and derive the datagram size from
    ///  that, but there is too much uncertainty involved (e.g. optional IP headers introduced
    ///  by some network hardware). The responsibility of choosing a datagram size that the
    ///  network actually carries therefore stays with the application: choosing it too big
    ///  causes silent datagram loss, choosing it too small wastes bandwidth on header overhead.
    pub datagram_size: usize,

    /// The liveness window: peers that stay silent for longer than this interval are reported
    ///  as disconnected. To stay visibly alive itself, this instance sends a keep-alive
    ///  datagram whenever it has had no outbound traffic for half this interval, leaving the
    ///  other half as margin for scheduling and network jitter.
    pub keep_alive_interval: Duration,

    /// multicast time-to-live (hop limit)
    pub time_to_live: u32,

    /// whether a sender also receives its own multicast traffic. Even with loopback enabled,
    ///  a transport drops datagrams carrying its own source id rather than dispatching them.
    pub loopback_mode: bool,

    /// The local address for the unicast variant to bind to. `None` binds to an ephemeral
    ///  port on the unspecified address of the remote peer's address family.
    pub bind_addr: Option<SocketAddr>,

    /// the number of datagram buffers that may be outstanding before the exhaustion policy
    ///  kicks in; also the number of buffers the pool retains for reuse
    pub max_outstanding_buffers: usize,
    pub pool_exhaustion_policy: PoolExhaustionPolicy,

    /// Incomplete reassembly entries older than this window are purged to bound memory under
    ///  fragment loss. Deliberately independent of the keep-alive interval: recovery from a
    ///  lost fragment is the responsibility of the broker's redelivery layer, not ours.
    pub reassembly_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            datagram_size: 4 * 1024,
            keep_alive_interval: Duration::from_millis(5000),
            time_to_live: 1,
            loopback_mode: false,
            bind_addr: None,
            max_outstanding_buffers: 64,
            pool_exhaustion_policy: PoolExhaustionPolicy::Allocate,
            reassembly_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        // the biggest header variant plus at least one payload byte per fragment
        let min_datagram_size = DatagramHeader::serialized_len(Some("[::]:0".parse()?)) + 1;
        if self.datagram_size < min_datagram_size {
            bail!("datagram size {} is too small, must be at least {}", self.datagram_size, min_datagram_size);
        }
        if self.keep_alive_interval.is_zero() {
            bail!("keep-alive interval must not be zero");
        }
        if self.max_outstanding_buffers == 0 {
            bail!("buffer pool must allow at least one outstanding buffer");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::tiny_datagram(TransportConfig { datagram_size: 16, ..TransportConfig::default() })]
    #[case::zero_keep_alive(TransportConfig { keep_alive_interval: Duration::ZERO, ..TransportConfig::default() })]
    #[case::zero_buffers(TransportConfig { max_outstanding_buffers: 0, ..TransportConfig::default() })]
    fn test_validate_rejects(#[case] config: TransportConfig) {
        assert!(config.validate().is_err());
    }
}
