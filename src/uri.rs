use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use anyhow::{anyhow, bail, Context};

/// The scheme of a connection URI selects unicast vs. multicast mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportScheme {
    Udp,
    Multicast,
}

/// A connection URI `<scheme>://<host>:<port>`. For multicast, host and port denote the group
///  address and port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportUri {
    pub scheme: TransportScheme,
    pub host: String,
    pub port: u16,
}

impl TransportUri {
    /// Resolve the host to a socket address. Resolution is deferred to transport start rather
    ///  than done at parse time, so a transport can be configured before DNS is reachable.
    pub async fn resolve(&self) -> anyhow::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port)).await
            .with_context(|| format!("resolving {}", self))?
            .next()
            .ok_or_else(|| anyhow!("{} did not resolve to any address", self))
    }
}

impl FromStr for TransportUri {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<TransportUri> {
        let (scheme, rest) = match s.split_once("://") {
            Some(x) => x,
            None => bail!("invalid connection URI {:?}: missing scheme", s),
        };

        let scheme = match scheme {
            "udp" => TransportScheme::Udp,
            "multicast" => TransportScheme::Multicast,
            _ => bail!("invalid connection URI {:?}: unsupported scheme {:?}", s, scheme),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some(x) => x,
            None => bail!("invalid connection URI {:?}: missing port", s),
        };

        // IP V6 hosts are bracketed, e.g. multicast://[ff02::1]:9123
        let host = host.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            bail!("invalid connection URI {:?}: empty host", s);
        }

        let port = port.parse::<u16>()
            .with_context(|| format!("invalid connection URI {:?}: invalid port", s))?;

        Ok(TransportUri {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

impl Display for TransportUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.scheme {
            TransportScheme::Udp => "udp",
            TransportScheme::Multicast => "multicast",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::udp("udp://localhost:8891", TransportScheme::Udp, "localhost", 8891)]
    #[case::multicast("multicast://239.1.1.1:9123", TransportScheme::Multicast, "239.1.1.1", 9123)]
    #[case::ipv6("udp://[::1]:9000", TransportScheme::Udp, "::1", 9000)]
    fn test_parse(#[case] uri: &str, #[case] scheme: TransportScheme, #[case] host: &str, #[case] port: u16) {
        let parsed = uri.parse::<TransportUri>().unwrap();
        assert_eq!(parsed.scheme, scheme);
        assert_eq!(parsed.host, host);
        assert_eq!(parsed.port, port);
    }

    #[rstest]
    #[case::no_scheme("localhost:8891")]
    #[case::bad_scheme("tcp://localhost:8891")]
    #[case::no_port("udp://localhost")]
    #[case::bad_port("udp://localhost:notaport")]
    #[case::port_out_of_range("udp://localhost:99999")]
    #[case::empty_host("udp://:8891")]
    fn test_parse_invalid(#[case] uri: &str) {
        assert!(uri.parse::<TransportUri>().is_err());
    }

    #[rstest]
    #[case("udp://localhost:8891")]
    #[case("multicast://239.1.1.1:9123")]
    fn test_display_round_trip(#[case] uri: &str) {
        assert_eq!(uri.parse::<TransportUri>().unwrap().to_string(), uri);
    }

    #[tokio::test]
    async fn test_resolve() {
        let uri = "udp://127.0.0.1:9000".parse::<TransportUri>().unwrap();
        assert_eq!(uri.resolve().await.unwrap(), "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
    }
}
