//! Wire protocol definitions and constants
//!
//! Every tunnel frame is a plain transport [`Message`](crate::transport::Message)
//! whose routing metadata travels in well-known header keys. Link probes
//! are a separate message class identified by `Micro-Method: link`.

use crate::transport::Message;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid message type: {0}")]
    InvalidMessageType(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Header carrying the frame type
pub const HEADER_TYPE: &str = "Micro-Tunnel";

/// Header carrying the sending tunnel id
pub const HEADER_TUNNEL_ID: &str = "Micro-Tunnel-Id";

/// Header carrying the logical channel
pub const HEADER_CHANNEL: &str = "Micro-Tunnel-Channel";

/// Header carrying the session id
pub const HEADER_SESSION: &str = "Micro-Tunnel-Session";

/// Header carrying the sender's link id
pub const HEADER_LINK: &str = "Micro-Tunnel-Link";

/// Prefix shared by every tunnel routing header
pub const HEADER_PREFIX: &str = "Micro-Tunnel";

/// Header marking link control messages
pub const HEADER_METHOD: &str = "Micro-Method";

/// Value of [`HEADER_METHOD`] for link probes
pub const METHOD_LINK: &str = "link";

/// Header carrying the probing link's id
pub const HEADER_LINK_ID: &str = "Micro-Link-Id";

/// Header added to received session messages naming the link they arrived on
pub const HEADER_RECEIVED_LINK: &str = "Micro-Link";

/// Link probe request body
pub const LINK_REQUEST: [u8; 4] = [0, 0, 0, 0];

/// Link probe response body
pub const LINK_RESPONSE: [u8; 4] = [1, 1, 1, 1];

/// Session id reserved for an open listen on a channel
pub const LISTENER_SESSION: &str = "listener";

/// Session id shared by multicast discovery and multicast listeners
pub const MULTICAST_SESSION: &str = "multicast";

/// Session id shared by broadcast listeners
pub const BROADCAST_SESSION: &str = "broadcast";

/// Default token shared by tunnels that were not given one
pub const DEFAULT_TOKEN: &str = "mesh.tunnel";

/// Maximum encoded message size (4 MB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Largest sealed session payload, leaving room for the routing headers
pub const MAX_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - 64 * 1024;

/// Default dial timeout in milliseconds
pub const DIAL_TIMEOUT_MS: u64 = 5_000;

/// Default keepalive interval in milliseconds
pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;

/// Default discover interval in milliseconds
pub const DISCOVER_INTERVAL_MS: u64 = 30_000;

/// Default reconnect interval in milliseconds
pub const RECONNECT_INTERVAL_MS: u64 = 5_000;

/// Channel mapping TTL in milliseconds
pub const CHANNEL_TTL_MS: u64 = 120_000;

/// Link probe interval in milliseconds
pub const PROBE_INTERVAL_MS: u64 = 60_000;

/// Link metrics batch interval in milliseconds
pub const METRICS_INTERVAL_MS: u64 = 5_000;

/// Default bounded queue capacity
pub const QUEUE_SIZE: usize = 128;

/// Capacity of the link probe queue
pub const PROBE_QUEUE_SIZE: usize = 64;

/// Consecutive errors after which a link reports error state
pub const ERROR_THRESHOLD: u32 = 3;

/// Returns true when a message is a link control probe
pub fn is_link_probe(msg: &Message) -> bool {
    msg.body.len() == LINK_REQUEST.len()
        && msg.header.get(HEADER_METHOD).map(String::as_str) == Some(METHOD_LINK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_detection() {
        let mut msg = Message::new(LINK_REQUEST.to_vec());
        assert!(!is_link_probe(&msg));

        msg = msg.with_header(HEADER_METHOD, "rpc");
        assert!(!is_link_probe(&msg));

        msg = msg.with_header(HEADER_METHOD, METHOD_LINK);
        assert!(is_link_probe(&msg));

        let response =
            Message::new(LINK_RESPONSE.to_vec()).with_header(HEADER_METHOD, METHOD_LINK);
        assert!(is_link_probe(&response));

        // Traffic that merely carries the header is not a probe
        let traffic = Message::new(&b"payload"[..]).with_header(HEADER_METHOD, METHOD_LINK);
        assert!(!is_link_probe(&traffic));
        assert!(!is_link_probe(&Message::default().with_header(HEADER_METHOD, METHOD_LINK)));
    }

    #[test]
    fn test_routing_headers_share_prefix() {
        for key in [HEADER_TYPE, HEADER_TUNNEL_ID, HEADER_CHANNEL, HEADER_SESSION, HEADER_LINK] {
            assert!(key.starts_with(HEADER_PREFIX));
        }
        assert!(!HEADER_METHOD.starts_with(HEADER_PREFIX));
    }
}
