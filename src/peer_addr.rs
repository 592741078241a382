use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Identifies a remote peer by its network address. This is the key for all per-peer state,
///  so two addresses that reach the same peer must compare equal: IPv4-mapped IPv6 addresses
///  (as reported by dual-stack sockets) are normalized to plain IPv4.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerAddr {
    ip: IpAddr,
    port: u16,
}

impl PeerAddr {
    pub fn new(ip: IpAddr, port: u16) -> PeerAddr {
        PeerAddr {
            ip: ip.to_canonical(),
            port,
        }
    }

    #[cfg(test)]
    pub fn localhost(port: u16) -> PeerAddr {
        PeerAddr::new(IpAddr::from([127, 0, 0, 1]), port)
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr::new(addr.ip(), addr.port())
    }
}

impl From<PeerAddr> for SocketAddr {
    fn from(addr: PeerAddr) -> Self {
        addr.socket_addr()
    }
}

impl FromStr for PeerAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SocketAddr::from_str(s)?.into())
    }
}

impl Debug for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.socket_addr())
    }
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rustc_hash::FxHashSet;

    #[rstest]
    #[case::same("127.0.0.1:1234", "127.0.0.1:1234", true)]
    #[case::different_port("127.0.0.1:1234", "127.0.0.1:1235", false)]
    #[case::different_ip("127.0.0.1:1234", "127.0.0.2:1234", false)]
    #[case::v6("[::1]:1234", "[::1]:1234", true)]
    #[case::v4_mapped("[::ffff:10.0.0.1]:80", "10.0.0.1:80", true)]
    #[case::v6_loopback_is_not_v4("[::1]:1234", "127.0.0.1:1234", false)]
    fn test_equality_and_hash(#[case] a: &str, #[case] b: &str, #[case] expected: bool) {
        let a = PeerAddr::from_str(a).unwrap();
        let b = PeerAddr::from_str(b).unwrap();

        assert_eq!(a == b, expected);

        let mut set = FxHashSet::default();
        set.insert(a);
        assert_eq!(set.contains(&b), expected);
    }

    #[rstest]
    #[case::v4("1.2.3.4:5", "[1.2.3.4:5]", "1.2.3.4:5")]
    #[case::v6("[1:2::3]:5", "[[1:2::3]:5]", "[1:2::3]:5")]
    fn test_fmt(#[case] raw: &str, #[case] expected_debug: &str, #[case] expected_display: &str) {
        let addr = PeerAddr::from_str(raw).unwrap();
        assert_eq!(format!("{:?}", addr), expected_debug);
        assert_eq!(format!("{}", addr), expected_display);
    }

    #[rstest]
    #[case::v4("10.0.0.1", "10.0.0.1")]
    #[case::v4_mapped("::ffff:10.0.0.1", "10.0.0.1")]
    #[case::v6("1:2::3", "1:2::3")]
    fn test_new_normalizes_ip(#[case] raw_ip: &str, #[case] expected_ip: &str) {
        let addr = PeerAddr::new(IpAddr::from_str(raw_ip).unwrap(), 80);
        assert_eq!(addr.ip(), IpAddr::from_str(expected_ip).unwrap());
        assert_eq!(addr.port(), 80);
        assert_eq!(addr, PeerAddr::new(IpAddr::from_str(expected_ip).unwrap(), 80));
    }

    #[test]
    fn test_from_str_invalid() {
        assert!(PeerAddr::from_str("localhost").is_err());
        assert!(PeerAddr::from_str("1.2.3.4").is_err());
    }

    #[test]
    fn test_socket_addr() {
        let socket_addr = SocketAddr::from(([10, 1, 2, 3], 999));
        let addr = PeerAddr::from(socket_addr);
        assert_eq!(addr.socket_addr(), socket_addr);
        assert_eq!(SocketAddr::from(addr), socket_addr);
        assert_eq!(addr, PeerAddr::new(IpAddr::from([10, 1, 2, 3]), 999));
    }
}
