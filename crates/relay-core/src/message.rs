//! Discovery protocol messages.
//!
//! Each message is its literal tag string sent as one UDP datagram. There is
//! no length prefix, version or payload; decoding is exact byte equality.

use std::fmt::{self, Display, Formatter};

/// Largest datagram the discovery listener reads.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

const REQUEST_TAG: &str = "DISCOVERY_REQUEST";
const RESPONSE_TAG: &str = "DISCOVERY_RESPONSE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryMessage {
    /// Multicast probe asking every listener to identify itself
    Request,
    /// Direct reply to the sender of a probe
    Response,
}

impl DiscoveryMessage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMessage::Request => REQUEST_TAG,
            DiscoveryMessage::Response => RESPONSE_TAG,
        }
    }

    /// Wire bytes for this message.
    pub fn to_binary(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// Decode a datagram.
    ///
    /// Returns None for anything that is not exactly one of the two tags.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        if data == REQUEST_TAG.as_bytes() {
            Some(DiscoveryMessage::Request)
        } else if data == RESPONSE_TAG.as_bytes() {
            Some(DiscoveryMessage::Response)
        } else {
            None
        }
    }

    pub fn wire_len(&self) -> usize {
        self.as_str().len()
    }
}

impl Display for DiscoveryMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
