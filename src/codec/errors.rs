//! Control-frame encoding errors
//!
//! This module defines error types that can occur when building a control
//! frame for the in-VM client. All errors implement the standard Error
//! trait for proper error propagation and handling.

use std::fmt;
use std::fmt::Display;

/// Control-frame encoding errors
#[derive(Debug)]
pub enum FrameError {
    /// The encoded payload does not fit the 16-bit length field
    ///
    /// Occurs when the combined iptables intents and hosts block exceed
    /// 65535 bytes. The frame is not sent; the configuration has to shrink
    /// before the client can be updated.
    Oversize(usize),
}

impl std::error::Error for FrameError {}

impl Display for FrameError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::Oversize(len) => {
                write!(fmt, "control payload of {} bytes exceeds 16-bit length", len)
            }
        }
    }
}
