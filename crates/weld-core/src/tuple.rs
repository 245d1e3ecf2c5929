//! Session tuple and transport type definitions

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Transport protocol of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP (protocol number 6)
    Tcp,
    /// UDP (protocol number 17)
    Udp,
}

impl Protocol {
    /// Create from protocol number
    pub fn from_u8(proto: u8) -> Option<Self> {
        match proto {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }

    /// Get protocol number
    pub fn to_u8(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }

    /// Lowercase name, used for metric names and log fields
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// Parse "tcp"/"udp" case-insensitively
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Set of protocols a subscription accepts
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProtocolMask: u8 {
        /// Accept TCP sessions
        const TCP = 0b01;
        /// Accept UDP sessions
        const UDP = 0b10;
    }
}

impl ProtocolMask {
    /// Whether the mask contains the given protocol
    pub fn accepts(self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Tcp => self.contains(ProtocolMask::TCP),
            Protocol::Udp => self.contains(ProtocolMask::UDP),
        }
    }
}

impl From<Protocol> for ProtocolMask {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => ProtocolMask::TCP,
            Protocol::Udp => ProtocolMask::UDP,
        }
    }
}

/// One end of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The connection initiator
    Client,
    /// The connection target
    Server,
}

impl Side {
    /// The other end of the session
    pub fn opposite(self) -> Self {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Server => "server",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a connection attempt
///
/// Created once per new session request and never mutated; a modified
/// request produces a new tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionTuple {
    /// Transport protocol
    pub protocol: Protocol,
    /// Client (initiator) address
    pub client_addr: IpAddr,
    /// Client port
    pub client_port: u16,
    /// Server (target) address
    pub server_addr: IpAddr,
    /// Server port
    pub server_port: u16,
}

impl SessionTuple {
    /// Build a tuple from two socket addresses
    pub fn new(protocol: Protocol, client: SocketAddr, server: SocketAddr) -> Self {
        Self {
            protocol,
            client_addr: client.ip(),
            client_port: client.port(),
            server_addr: server.ip(),
            server_port: server.port(),
        }
    }

    /// Client endpoint
    pub fn client(&self) -> SocketAddr {
        SocketAddr::new(self.client_addr, self.client_port)
    }

    /// Server endpoint, the key used by fitting hints
    pub fn server(&self) -> SocketAddr {
        SocketAddr::new(self.server_addr, self.server_port)
    }

    /// Copy of this tuple with a different server endpoint
    pub fn with_server(self, server: SocketAddr) -> Self {
        Self {
            server_addr: server.ip(),
            server_port: server.port(),
            ..self
        }
    }

    /// Copy of this tuple with a different client endpoint
    pub fn with_client(self, client: SocketAddr) -> Self {
        Self {
            client_addr: client.ip(),
            client_port: client.port(),
            ..self
        }
    }
}

impl fmt::Display for SessionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.client(), self.server())
    }
}

/// Common well-known ports
pub mod ports {
    /// FTP control port
    pub const FTP: u16 = 21;
    /// SMTP port
    pub const SMTP: u16 = 25;
    /// HTTP port
    pub const HTTP: u16 = 80;
    /// HTTPS port
    pub const HTTPS: u16 = 443;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tuple() -> SessionTuple {
        SessionTuple::new(
            Protocol::Tcp,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 40000),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), 80),
        )
    }

    #[test]
    fn test_protocol_numbers() {
        assert_eq!(Protocol::from_u8(6), Some(Protocol::Tcp));
        assert_eq!(Protocol::from_u8(17), Some(Protocol::Udp));
        assert_eq!(Protocol::from_u8(1), None);
        assert_eq!(Protocol::Udp.to_u8(), 17);
    }

    #[test]
    fn test_protocol_mask() {
        let both = ProtocolMask::TCP | ProtocolMask::UDP;
        assert!(both.accepts(Protocol::Tcp));
        assert!(both.accepts(Protocol::Udp));
        assert!(!ProtocolMask::TCP.accepts(Protocol::Udp));
        assert_eq!(ProtocolMask::from(Protocol::Udp), ProtocolMask::UDP);
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Client.opposite(), Side::Server);
        assert_eq!(Side::Server.opposite(), Side::Client);
    }

    #[test]
    fn test_tuple_endpoints() {
        let t = tuple();
        assert_eq!(t.server().port(), 80);
        assert_eq!(t.client().port(), 40000);

        let moved = t.with_server("10.0.0.1:8080".parse().unwrap());
        assert_eq!(moved.server_port, 8080);
        assert_eq!(moved.client(), t.client());
    }

    #[test]
    fn test_tuple_display() {
        assert_eq!(tuple().to_string(), "tcp 192.168.1.10:40000 -> 93.184.216.34:80");
    }
}
