//! WebSocket frame parsing
//!
//! Decodes RFC 6455 frames from the raw bytes of an upgraded connection so
//! they can be reported to observers. The relayed bytes are never touched.

use std::sync::{Arc, Mutex};

use crate::io::RelayObserver;
use crate::models::{MessageDirection, WebSocketFrame, WebSocketOpcode};
use crate::proxy::hooks::FrameObserver;

/// Maximum payload we'll capture per frame (to avoid memory issues with large binary frames)
pub const MAX_CAPTURE_SIZE: usize = 256 * 1024; // 256KB

/// Largest possible header: 2 + 8 length bytes + 4 mask bytes.
const MAX_HEADER_LEN: usize = 14;

/// Parsed WebSocket frame header
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: WebSocketOpcode,
    pub masked: bool,
    pub payload_len: u64,
    pub mask_key: Option<[u8; 4]>,
    pub header_len: usize,
}

#[derive(Debug, Clone)]
pub enum HeaderParse {
    /// More bytes are needed.
    Incomplete,
    /// The opcode nibble is reserved; the stream cannot be followed.
    Invalid(u8),
    Complete(FrameHeader),
}

/// Parse a WebSocket frame header from the start of `data`.
pub fn parse_frame_header(data: &[u8]) -> HeaderParse {
    if data.len() < 2 {
        return HeaderParse::Incomplete;
    }

    let fin = (data[0] & 0x80) != 0;
    let Some(opcode) = WebSocketOpcode::from_u8(data[0] & 0x0F) else {
        return HeaderParse::Invalid(data[0] & 0x0F);
    };
    let masked = (data[1] & 0x80) != 0;
    let mut payload_len = (data[1] & 0x7F) as u64;

    let mut offset = 2;

    // Extended payload length
    if payload_len == 126 {
        if data.len() < offset + 2 {
            return HeaderParse::Incomplete;
        }
        payload_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as u64;
        offset += 2;
    } else if payload_len == 127 {
        if data.len() < offset + 8 {
            return HeaderParse::Incomplete;
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&data[offset..offset + 8]);
        payload_len = u64::from_be_bytes(len);
        offset += 8;
    }

    // Masking key (only present for client -> server frames)
    let mask_key = if masked {
        if data.len() < offset + 4 {
            return HeaderParse::Incomplete;
        }
        let key = [
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    HeaderParse::Complete(FrameHeader {
        fin,
        opcode,
        masked,
        payload_len,
        mask_key,
        header_len: offset,
    })
}

/// Unmask payload data in place. `offset` is the position of `data[0]`
/// within the frame payload.
pub fn unmask_payload(data: &mut [u8], mask_key: [u8; 4], offset: u64) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask_key[((offset + i as u64) % 4) as usize];
    }
}

#[derive(Debug)]
struct PartialFrame {
    header: FrameHeader,
    received: u64,
    captured: Vec<u8>,
}

#[derive(Debug, Default)]
struct DirectionState {
    header_buf: Vec<u8>,
    frame: Option<PartialFrame>,
    desynced: bool,
}

impl DirectionState {
    /// Consume `data`, returning every frame completed by it.
    fn feed(&mut self, session_id: &str, direction: MessageDirection, mut data: &[u8]) -> Vec<WebSocketFrame> {
        let mut frames = Vec::new();

        while !data.is_empty() && !self.desynced {
            let Some(frame) = self.frame.as_mut() else {
                let wanted = MAX_HEADER_LEN.saturating_sub(self.header_buf.len()).min(data.len());
                let before = self.header_buf.len();
                self.header_buf.extend_from_slice(&data[..wanted]);
                match parse_frame_header(&self.header_buf) {
                    HeaderParse::Incomplete => {
                        data = &data[wanted..];
                    }
                    HeaderParse::Invalid(opcode) => {
                        tracing::debug!(
                            "websocket {} {}: reserved opcode {:#x}, frame decoding stopped",
                            session_id,
                            direction.as_str(),
                            opcode
                        );
                        self.desynced = true;
                    }
                    HeaderParse::Complete(header) => {
                        // Bytes past the header belong to the payload.
                        data = &data[header.header_len - before..];
                        self.header_buf.clear();
                        let capture = header.payload_len.min(MAX_CAPTURE_SIZE as u64) as usize;
                        self.frame = Some(PartialFrame {
                            header,
                            received: 0,
                            captured: Vec::with_capacity(capture),
                        });
                    }
                }
                if let Some(done) = self.finish_if_complete(session_id, direction) {
                    frames.push(done);
                }
                continue;
            };

            let remaining = frame.header.payload_len - frame.received;
            let take = remaining.min(data.len() as u64) as usize;
            let room = MAX_CAPTURE_SIZE.saturating_sub(frame.captured.len()).min(take);
            if room > 0 {
                let start = frame.captured.len();
                frame.captured.extend_from_slice(&data[..room]);
                if let Some(mask) = frame.header.mask_key {
                    unmask_payload(&mut frame.captured[start..], mask, frame.received);
                }
            }
            frame.received += take as u64;
            data = &data[take..];

            if let Some(done) = self.finish_if_complete(session_id, direction) {
                frames.push(done);
            }
        }

        frames
    }

    fn finish_if_complete(&mut self, session_id: &str, direction: MessageDirection) -> Option<WebSocketFrame> {
        let complete = self
            .frame
            .as_ref()
            .is_some_and(|frame| frame.received == frame.header.payload_len);
        if !complete {
            return None;
        }
        let frame = self.frame.take()?;
        Some(WebSocketFrame::new(
            session_id.to_string(),
            direction,
            frame.header.opcode,
            frame.captured,
            frame.header.payload_len,
            frame.header.fin,
        ))
    }
}

/// Follows both directions of an upgraded connection and hands each complete
/// frame to the registered observers.
pub struct WebSocketFrameDecoder {
    session_id: String,
    observers: Vec<FrameObserver>,
    client: Mutex<DirectionState>,
    server: Mutex<DirectionState>,
}

impl std::fmt::Debug for WebSocketFrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketFrameDecoder")
            .field("session_id", &self.session_id)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl WebSocketFrameDecoder {
    pub fn new(session_id: impl Into<String>, observers: Vec<FrameObserver>) -> Self {
        Self {
            session_id: session_id.into(),
            observers,
            client: Mutex::new(DirectionState::default()),
            server: Mutex::new(DirectionState::default()),
        }
    }

    /// Feed relayed bytes and notify observers of completed frames.
    pub fn feed(&self, direction: MessageDirection, data: &[u8]) {
        let state = match direction {
            MessageDirection::ClientToServer => &self.client,
            MessageDirection::ServerToClient => &self.server,
        };
        let frames = match state.lock() {
            Ok(mut state) => state.feed(&self.session_id, direction, data),
            Err(_) => return,
        };
        for frame in &frames {
            for observer in &self.observers {
                observer(frame);
            }
        }
    }

    pub fn into_relay_observer(self) -> RelayObserver {
        let decoder = Arc::new(self);
        Arc::new(move |direction, data| decoder.feed(direction, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked_frame(opcode: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut out = vec![0x80 | opcode];
        match payload.len() {
            n if n < 126 => out.push(0x80 | n as u8),
            n if n <= u16::MAX as usize => {
                out.push(0x80 | 126);
                out.extend_from_slice(&(n as u16).to_be_bytes());
            }
            n => {
                out.push(0x80 | 127);
                out.extend_from_slice(&(n as u64).to_be_bytes());
            }
        }
        out.extend_from_slice(&mask);
        let mut body = payload.to_vec();
        unmask_payload(&mut body, mask, 0);
        out.extend_from_slice(&body);
        out
    }

    fn collecting() -> (WebSocketFrameDecoder, Arc<Mutex<Vec<WebSocketFrame>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: FrameObserver = Arc::new(move |frame: &WebSocketFrame| {
            sink.lock().unwrap().push(frame.clone());
        });
        (WebSocketFrameDecoder::new("s1", vec![observer]), seen)
    }

    #[test]
    fn parses_extended_lengths() {
        let mut data = vec![0x82, 126];
        data.extend_from_slice(&300u16.to_be_bytes());
        match parse_frame_header(&data) {
            HeaderParse::Complete(header) => {
                assert_eq!(header.payload_len, 300);
                assert_eq!(header.header_len, 4);
                assert_eq!(header.opcode, WebSocketOpcode::Binary);
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut data = vec![0x82, 127];
        data.extend_from_slice(&70_000u64.to_be_bytes()[..4]);
        assert!(matches!(parse_frame_header(&data), HeaderParse::Incomplete));
        assert!(matches!(parse_frame_header(&[0x83, 0]), HeaderParse::Invalid(3)));
    }

    #[test]
    fn unmasks_frames_split_across_reads() {
        let (decoder, seen) = collecting();
        let wire = masked_frame(0x1, b"hello websocket", [1, 2, 3, 4]);
        for chunk in wire.chunks(3) {
            decoder.feed(MessageDirection::ClientToServer, chunk);
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload_as_string().as_deref(), Some("hello websocket"));
        assert_eq!(seen[0].direction, MessageDirection::ClientToServer);
        assert!(seen[0].is_final);
    }

    #[test]
    fn several_frames_in_one_read() {
        let (decoder, seen) = collecting();
        let mut wire = vec![0x81, 2, b'h', b'i'];
        wire.extend_from_slice(&[0x89, 0]);
        wire.extend_from_slice(&[0x88, 2, 0x03, 0xE8]);
        decoder.feed(MessageDirection::ServerToClient, &wire);
        let seen = seen.lock().unwrap();
        let opcodes: Vec<_> = seen.iter().map(|f| f.opcode).collect();
        assert_eq!(
            opcodes,
            vec![WebSocketOpcode::Text, WebSocketOpcode::Ping, WebSocketOpcode::Close]
        );
        assert_eq!(seen[2].close_reason(), Some((1000, String::new())));
    }

    #[test]
    fn large_payloads_are_capped() {
        let (decoder, seen) = collecting();
        let payload = vec![7u8; MAX_CAPTURE_SIZE + 10];
        let wire = masked_frame(0x2, &payload, [9, 9, 9, 9]);
        for chunk in wire.chunks(64 * 1024) {
            decoder.feed(MessageDirection::ClientToServer, chunk);
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload.len(), MAX_CAPTURE_SIZE);
        assert_eq!(seen[0].payload_length, (MAX_CAPTURE_SIZE + 10) as u64);
        assert!(seen[0].is_truncated());
        assert!(seen[0].payload.iter().all(|b| *b == 7));
    }

    #[test]
    fn directions_are_tracked_separately() {
        let (decoder, seen) = collecting();
        decoder.feed(MessageDirection::ClientToServer, &[0x81]);
        decoder.feed(MessageDirection::ServerToClient, &[0x81, 1, b'a']);
        decoder.feed(MessageDirection::ClientToServer, &[1, b'b']);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].payload, b"a");
        assert_eq!(seen[1].payload, b"b");
    }

    #[test]
    fn reserved_opcode_stops_decoding() {
        let (decoder, seen) = collecting();
        decoder.feed(MessageDirection::ServerToClient, &[0x83, 0, 0x81, 1, b'x']);
        assert!(seen.lock().unwrap().is_empty());
    }
}
