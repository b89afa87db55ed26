//! Tunnel frames carried over links
//!
//! A frame is a transport message whose routing context lives in headers:
//! ```text
//! Micro-Tunnel:          connect | close | open | accept | discover
//!                        | announce | session | keepalive
//! Micro-Tunnel-Id:       sending tunnel id
//! Micro-Tunnel-Channel:  logical channel (or comma separated list on announce)
//! Micro-Tunnel-Session:  session id
//! Micro-Tunnel-Link:     sender's link id
//! ```
//! Any other header and the body belong to the session payload.

use crate::protocol::{
    ProtocolError, HEADER_CHANNEL, HEADER_LINK, HEADER_PREFIX, HEADER_SESSION, HEADER_TUNNEL_ID,
    HEADER_TYPE,
};
use crate::transport::Message;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Link is up
    Connect,
    /// Tear down a link or a session
    Close,
    /// Dialer asks to open a unicast session
    Open,
    /// Listener accepted an open
    Accept,
    /// Ask which channels a peer routes
    Discover,
    /// Advertise routed channels
    Announce,
    /// Session data
    Session,
    /// Link liveness refresh
    Keepalive,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Connect => "connect",
            FrameType::Close => "close",
            FrameType::Open => "open",
            FrameType::Accept => "accept",
            FrameType::Discover => "discover",
            FrameType::Announce => "announce",
            FrameType::Session => "session",
            FrameType::Keepalive => "keepalive",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameType {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "connect" => Ok(FrameType::Connect),
            "close" => Ok(FrameType::Close),
            "open" => Ok(FrameType::Open),
            "accept" => Ok(FrameType::Accept),
            "discover" => Ok(FrameType::Discover),
            "announce" => Ok(FrameType::Announce),
            "session" => Ok(FrameType::Session),
            "keepalive" => Ok(FrameType::Keepalive),
            _ => Err(ProtocolError::InvalidMessageType(value.to_string())),
        }
    }
}

/// A tunnel protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Id of the sending tunnel
    pub tunnel_id: String,
    /// Logical channel
    pub channel: Option<String>,
    /// Session id
    pub session: Option<String>,
    /// Sender's link id
    pub link: Option<String>,
    /// Payload headers
    pub header: HashMap<String, String>,
    /// Payload body
    pub body: Bytes,
}

impl Frame {
    /// Create a frame with no routing context beyond the sender
    pub fn new(frame_type: FrameType, tunnel_id: impl Into<String>) -> Self {
        Self {
            frame_type,
            tunnel_id: tunnel_id.into(),
            channel: None,
            session: None,
            link: None,
            header: HashMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into()).filter(|c: &String| !c.is_empty());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into()).filter(|l: &String| !l.is_empty());
        self
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: Message) -> Self {
        self.header = payload.header;
        self.body = payload.body;
        self
    }

    /// Channels listed by an announce frame
    pub fn channels(&self) -> Vec<String> {
        self.channel
            .as_deref()
            .map(|list| {
                list.split(',')
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Detach the payload
    pub fn payload(&self) -> Message {
        Message {
            header: self.header.clone(),
            body: self.body.clone(),
        }
    }

    /// Encode into a transport message
    pub fn encode(&self) -> Message {
        let mut header = self.header.clone();

        header.insert(HEADER_TYPE.to_string(), self.frame_type.as_str().to_string());
        header.insert(HEADER_TUNNEL_ID.to_string(), self.tunnel_id.clone());

        if let Some(channel) = &self.channel {
            header.insert(HEADER_CHANNEL.to_string(), channel.clone());
        }
        if let Some(session) = &self.session {
            header.insert(HEADER_SESSION.to_string(), session.clone());
        }
        if let Some(link) = &self.link {
            header.insert(HEADER_LINK.to_string(), link.clone());
        }

        Message {
            header,
            body: self.body.clone(),
        }
    }

    /// Decode a transport message, stripping the routing headers
    pub fn decode(msg: Message) -> Result<Self, ProtocolError> {
        let Message { mut header, body } = msg;

        let frame_type = header
            .remove(HEADER_TYPE)
            .ok_or(ProtocolError::MissingHeader(HEADER_TYPE))?
            .parse::<FrameType>()?;

        let tunnel_id = header.remove(HEADER_TUNNEL_ID).unwrap_or_default();
        let channel = header.remove(HEADER_CHANNEL).filter(|c| !c.is_empty());
        let session = header.remove(HEADER_SESSION).filter(|s| !s.is_empty());
        let link = header.remove(HEADER_LINK).filter(|l| !l.is_empty());

        // Unknown routing headers are dropped rather than leaked into the payload
        header.retain(|key, _| !key.starts_with(HEADER_PREFIX));

        Ok(Self {
            frame_type,
            tunnel_id,
            channel,
            session,
            link,
            header,
            body,
        })
    }
}
