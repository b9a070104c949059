//! Control frame encoding
//!
//! A control frame carries the current iptables intents and the hosts block
//! to the in-VM client:
//!
//! ```text
//! header[0] = 0x01        control tag
//! header[1] = len >> 8
//! header[2] = len & 0xff
//! payload   = "connect <key>" / "disconnect <key>" joined by ","
//!             then '\n' and the hosts block, when both are present
//! ```
//!
//! The header is one datagram; the payload follows as successive datagrams
//! of at most MTU bytes each, in order. There is no acknowledgement and no
//! retransmission: the client re-heartbeats periodically and any lost frame
//! is superseded by the next push. An empty payload suppresses the header
//! entirely.

use crate::codec::errors::FrameError;
use crate::codec::frame::CONTROL_TAG;
use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;

/// Length of the control header datagram
pub const HEADER_LEN: usize = 3;

/// An encoded control frame, ready to be chunked onto the wire
#[derive(Debug, Clone)]
pub struct ControlFrame {
    payload: BytesMut,
}

impl ControlFrame {
    /// Encode the iptables intents and hosts block into a frame.
    ///
    /// Returns `Ok(None)` when there is nothing to send. Intents iterate in
    /// key order, so the same tables always encode to the same payload.
    pub fn encode(intents: &BTreeMap<String, bool>, hosts: &str) -> crate::Result<Option<ControlFrame>> {
        let mut payload = BytesMut::new();
        for (key, active) in intents {
            if !payload.is_empty() {
                payload.put_u8(b',');
            }
            if *active {
                payload.put_slice(b"connect ");
            } else {
                payload.put_slice(b"disconnect ");
            }
            payload.put_slice(key.as_bytes());
        }
        if !hosts.is_empty() {
            if !payload.is_empty() {
                payload.put_u8(b'\n');
            }
            payload.put_slice(hosts.as_bytes());
        }

        if payload.is_empty() {
            return Ok(None);
        }
        if payload.len() > u16::MAX as usize {
            return Err(FrameError::Oversize(payload.len()).into());
        }
        Ok(Some(ControlFrame { payload }))
    }

    /// The 3-byte header datagram announcing the payload length
    pub fn header(&self) -> [u8; HEADER_LEN] {
        let len = self.payload.len() as u16;
        [CONTROL_TAG, (len >> 8) as u8, (len & 0xff) as u8]
    }

    /// Payload split into at-most-MTU-sized datagrams, in order
    pub fn chunks(&self, mtu: usize) -> impl Iterator<Item = &[u8]> {
        self.payload.chunks(mtu.max(1))
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
