//! WebSocket frame models
//!
//! Represents frames observed on an upgraded connection.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// WebSocket frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebSocketOpcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl WebSocketOpcode {
    /// Parse from raw opcode nibble
    pub fn from_u8(opcode: u8) -> Option<Self> {
        match opcode & 0x0F {
            0 => Some(WebSocketOpcode::Continuation),
            1 => Some(WebSocketOpcode::Text),
            2 => Some(WebSocketOpcode::Binary),
            8 => Some(WebSocketOpcode::Close),
            9 => Some(WebSocketOpcode::Ping),
            10 => Some(WebSocketOpcode::Pong),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WebSocketOpcode::Continuation => "CONTINUATION",
            WebSocketOpcode::Text => "TEXT",
            WebSocketOpcode::Binary => "BINARY",
            WebSocketOpcode::Close => "CLOSE",
            WebSocketOpcode::Ping => "PING",
            WebSocketOpcode::Pong => "PONG",
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(
            self,
            WebSocketOpcode::Close | WebSocketOpcode::Ping | WebSocketOpcode::Pong
        )
    }
}

/// Which way bytes were travelling through the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageDirection {
    ClientToServer,
    ServerToClient,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::ClientToServer => "→",
            MessageDirection::ServerToClient => "←",
        }
    }
}

/// A single decoded WebSocket frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketFrame {
    /// Session that performed the upgrade
    pub session_id: String,
    pub direction: MessageDirection,
    pub opcode: WebSocketOpcode,

    /// Unmasked payload, possibly truncated
    pub payload: Vec<u8>,

    /// Payload length on the wire
    pub payload_length: u64,

    /// Milliseconds since epoch
    pub timestamp: i64,
    pub is_final: bool,
}

impl WebSocketFrame {
    pub fn new(
        session_id: String,
        direction: MessageDirection,
        opcode: WebSocketOpcode,
        payload: Vec<u8>,
        payload_length: u64,
        is_final: bool,
    ) -> Self {
        Self {
            session_id,
            direction,
            opcode,
            payload,
            payload_length,
            timestamp: Utc::now().timestamp_millis(),
            is_final,
        }
    }

    /// True when the captured payload is shorter than the wire payload
    pub fn is_truncated(&self) -> bool {
        (self.payload.len() as u64) < self.payload_length
    }

    /// Payload as UTF-8 for text frames
    pub fn payload_as_string(&self) -> Option<String> {
        if self.opcode == WebSocketOpcode::Text {
            String::from_utf8(self.payload.clone()).ok()
        } else {
            None
        }
    }

    /// Close code and reason for close frames
    pub fn close_reason(&self) -> Option<(u16, String)> {
        if self.opcode != WebSocketOpcode::Close || self.payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = String::from_utf8_lossy(&self.payload[2..]).to_string();
        Some((code, reason))
    }
}
