//! Datagram classification for the tunnel protocol
//!
//! Everything on the primary UDP socket is classified by its first byte:
//!
//! ```text
//! +--------+------------------------------+
//! | 0x00   | heartbeat (length must be 1) |
//! | 0x01   | config push (length > 1)     |
//! | other  | raw IPv4 packet              |
//! +--------+------------------------------+
//! ```
//!
//! There is no framing beyond the tag byte: a data datagram is the IP packet
//! itself (the version nibble `0x4` keeps it out of the tag space), and a
//! heartbeat is a single zero byte. Control frames sent in the opposite
//! direction (server to client) are built in [`crate::codec::control`].

use std::net::Ipv4Addr;

/// Heartbeat tag: a single `0x00` byte announces the client's liveness
/// and its current UDP address.
pub const HEARTBEAT_TAG: u8 = 0x00;

/// Control tag, used both directions:
/// - server -> client: 3-byte control header followed by payload datagrams
/// - client -> server: `[0x01, ...payload]` where the payload is appended
///   to the server's configuration
pub const CONTROL_TAG: u8 = 0x01;

/// Minimum length of an IPv4 header; anything shorter cannot be routed.
pub const MIN_IPV4_LEN: usize = 20;

/// An inbound datagram after classification
#[derive(Debug)]
pub enum Datagram<'a> {
    /// Single-byte liveness announcement from the client
    Heartbeat,
    /// Raw configuration bytes pushed by the client
    ConfigPush(&'a [u8]),
    /// An IPv4 packet to be routed by destination address
    Data(PacketView<'a>),
}

/// Classify a datagram received on the primary socket.
///
/// Anything that is not a heartbeat or a config push is treated as data;
/// the data path decides what to do with packets that turn out to be
/// malformed.
pub fn classify(buf: &[u8]) -> Datagram<'_> {
    if buf.len() == 1 && buf[0] == HEARTBEAT_TAG {
        Datagram::Heartbeat
    } else if buf.len() > 1 && buf[0] == CONTROL_TAG {
        Datagram::ConfigPush(&buf[1..])
    } else {
        Datagram::Data(PacketView::new(buf))
    }
}

/// Borrowed view over a raw IPv4 packet
///
/// Provides header field access without copying the packet. Callers must
/// check [`PacketView::invalid`] before reading addresses.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    payload: &'a [u8],
}

impl<'a> PacketView<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self { payload }
    }

    /// True if the packet is too short to carry an IPv4 header
    pub fn invalid(&self) -> bool {
        self.payload.len() < MIN_IPV4_LEN
    }

    /// IP version from the first header nibble (4 for IPv4)
    pub fn version(&self) -> u8 {
        self.payload[0] >> 4
    }

    /// Source address, bytes 12..16 of the IPv4 header
    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.payload[12],
            self.payload[13],
            self.payload[14],
            self.payload[15],
        )
    }

    /// Destination address, bytes 16..20 of the IPv4 header
    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.payload[16],
            self.payload[17],
            self.payload[18],
            self.payload[19],
        )
    }

    /// Transport protocol number (1 = ICMP, 6 = TCP, 17 = UDP)
    pub fn protocol(&self) -> u8 {
        self.payload[9]
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut pkt = vec![0u8; 28];
        pkt[0] = 0x45;
        pkt[9] = 17;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        pkt
    }

    #[test]
    fn classifies_heartbeat() {
        assert!(matches!(classify(&[0x00]), Datagram::Heartbeat));
    }

    #[test]
    fn single_control_byte_is_not_a_config_push() {
        // a lone 0x01 has no payload; it falls through to the data path
        assert!(matches!(classify(&[0x01]), Datagram::Data(_)));
    }

    #[test]
    fn classifies_config_push() {
        let buf = [0x01, b'r', b'o', b'u', b't', b'e'];
        match classify(&buf) {
            Datagram::ConfigPush(payload) => assert_eq!(payload, b"route"),
            other => panic!("expected config push, got {:?}", other),
        }
    }

    #[test]
    fn classifies_data_and_reads_header() {
        let pkt = ipv4_packet([10, 0, 0, 5], [172, 17, 0, 2]);
        match classify(&pkt) {
            Datagram::Data(view) => {
                assert!(!view.invalid());
                assert_eq!(view.version(), 4);
                assert_eq!(view.src(), Ipv4Addr::new(10, 0, 0, 5));
                assert_eq!(view.dst(), Ipv4Addr::new(172, 17, 0, 2));
                assert_eq!(view.protocol(), 17);
            }
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn short_data_is_invalid() {
        let buf = [0x45, 0x00, 0x00];
        match classify(&buf) {
            Datagram::Data(view) => assert!(view.invalid()),
            other => panic!("expected data, got {:?}", other),
        }
    }
}
