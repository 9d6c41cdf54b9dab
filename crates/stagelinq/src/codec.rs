//! Binary encode/decode of StagelinQ wire messages.
//!
//! All multi-byte integers are big-endian. Strings are length-prefixed by a
//! u32 byte count followed by UTF-16BE payload bytes (no BOM, no terminator).

use crate::error::{Error, Result};
use rand::RngCore;
use serde_json::Value as Json;

/// Soft cap on a single wire string, in UTF-16BE bytes.
pub const STRING_SOFT_CAP: usize = 64 * 1024;
/// Absolute hard cap no decoder may exceed regardless of configuration.
pub const STRING_HARD_CAP: usize = 10 * 1024 * 1024;
/// Hard cap on a single framed message (StateMap / BeatInfo channels).
pub const MESSAGE_HARD_CAP: usize = 10 * 1024 * 1024;

pub const DISCOVERY_MAGIC: &[u8; 4] = b"airD";
pub const SMAA_MAGIC: &[u8; 4] = b"smaa";
pub const ACTION_HOWDY: &str = "DISCOVERER_HOWDY_";
pub const ACTION_EXIT: &str = "DISCOVERER_EXIT_";
pub const DISCOVERY_PORT: u16 = 51337;
pub const NO_UPDATES_INTERVAL: u32 = 0xFFFF_FFFF;
pub const STATEMAP_SUBSCRIBE_MAGIC_ID: u32 = 0x0000_07D2;
pub const STATEMAP_EMIT_MAGIC_ID: u32 = 0x0000_0000;

const BEAT_START_STREAM: [u8; 4] = [0x00, 0x00, 0x00, 0x00];
const BEAT_STOP_STREAM: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const BEAT_EMIT: [u8; 4] = [0x00, 0x00, 0x00, 0x02];

/// A 16-byte opaque identity used on the StagelinQ network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub [u8; 16]);

impl Token {
    /// Generates a fresh random token with the MSB of byte 0 cleared.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[0] &= 0x7F;
        Token(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// A cursor over a byte slice with truncation-aware reads.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Truncated {
                expected: n,
                actual: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn token(&mut self) -> Result<Token> {
        Ok(Token(self.take(16)?.try_into().unwrap()))
    }

    fn string(&mut self, max_len: usize) -> Result<String> {
        let len = self.u32()? as usize;
        if len > max_len.min(STRING_HARD_CAP) {
            return Err(Error::Protocol(format!(
                "declared string length {len} exceeds cap {max_len}"
            )));
        }
        let bytes = self.take(len)?;
        decode_utf16be(bytes)
    }
}

fn decode_utf16be(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(Error::Protocol("odd-length UTF-16BE payload".into()));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| Error::Protocol(format!("invalid UTF-16BE: {e}")))
}

fn encode_utf16be(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    let encoded = encode_utf16be(s);
    buf.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
    buf.extend_from_slice(&encoded);
}

/// A UDP discovery datagram (HOWDY / EXIT).
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryMessage {
    pub token: Token,
    pub source: String,
    pub action: String,
    pub software_name: String,
    pub software_version: String,
    pub port: u16,
}

impl DiscoveryMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(DISCOVERY_MAGIC);
        buf.extend_from_slice(self.token.as_bytes());
        write_string(&mut buf, &self.source);
        write_string(&mut buf, &self.action);
        write_string(&mut buf, &self.software_name);
        write_string(&mut buf, &self.software_version);
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf
    }

    /// Decodes a discovery datagram. Returns `Ok(None)`, never an error, for
    /// any payload not beginning with the discovery magic (S3 in the
    /// testable-properties list).
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < 4 || &data[0..4] != DISCOVERY_MAGIC {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&data[4..]);
        let token = cursor.token()?;
        let source = cursor.string(STRING_SOFT_CAP)?;
        let action = cursor.string(STRING_SOFT_CAP)?;
        let software_name = cursor.string(STRING_SOFT_CAP)?;
        let software_version = cursor.string(STRING_SOFT_CAP)?;
        let port = cursor.u16()?;
        Ok(Some(DiscoveryMessage {
            token,
            source,
            action,
            software_name,
            software_version,
            port,
        }))
    }
}

/// Directory-channel messages (TCP, no outer length prefix).
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryMessage {
    ServiceAnnounce {
        token: Token,
        service: String,
        port: u16,
    },
    Reference {
        token_self: Token,
        token_peer: Token,
        reference: i64,
    },
    ServicesRequest {
        token: Token,
    },
}

impl DirectoryMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            DirectoryMessage::ServiceAnnounce {
                token,
                service,
                port,
            } => {
                buf.extend_from_slice(&0u32.to_be_bytes());
                buf.extend_from_slice(token.as_bytes());
                write_string(&mut buf, service);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            DirectoryMessage::Reference {
                token_self,
                token_peer,
                reference,
            } => {
                buf.extend_from_slice(&1u32.to_be_bytes());
                buf.extend_from_slice(token_self.as_bytes());
                buf.extend_from_slice(token_peer.as_bytes());
                buf.extend_from_slice(&reference.to_be_bytes());
            }
            DirectoryMessage::ServicesRequest { token } => {
                buf.extend_from_slice(&2u32.to_be_bytes());
                buf.extend_from_slice(token.as_bytes());
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let kind = cursor.u32()?;
        match kind {
            0 => {
                let token = cursor.token()?;
                let service = cursor.string(STRING_SOFT_CAP)?;
                let port = cursor.u16()?;
                Ok(DirectoryMessage::ServiceAnnounce {
                    token,
                    service,
                    port,
                })
            }
            1 => {
                let token_self = cursor.token()?;
                let token_peer = cursor.token()?;
                let reference = cursor.i64()?;
                Ok(DirectoryMessage::Reference {
                    token_self,
                    token_peer,
                    reference,
                })
            }
            2 => {
                let token = cursor.token()?;
                Ok(DirectoryMessage::ServicesRequest { token })
            }
            other => Err(Error::Protocol(format!(
                "unknown directory message kind 0x{other:02x}"
            ))),
        }
    }
}

/// One typed state value, tagged by the wire's `type_hint`.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Float(f64),
    Bool(bool),
    Text(String),
    Int(i64),
    Color(String),
}

/// A decoded state update.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub name: String,
    pub value: StateValue,
    pub type_hint: u32,
}

/// StateMap channel messages. The caller is responsible for removing the
/// generic outer length prefix (see `connection::read_framed`).
#[derive(Debug, Clone, PartialEq)]
pub enum StateMapMessage {
    Subscribe { name: String, interval: u32 },
    Emit(State),
}

impl StateMapMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(SMAA_MAGIC);
        match self {
            StateMapMessage::Subscribe { name, interval } => {
                buf.extend_from_slice(&STATEMAP_SUBSCRIBE_MAGIC_ID.to_be_bytes());
                write_string(&mut buf, name);
                buf.extend_from_slice(&interval.to_be_bytes());
            }
            StateMapMessage::Emit(state) => {
                buf.extend_from_slice(&STATEMAP_EMIT_MAGIC_ID.to_be_bytes());
                write_string(&mut buf, &state.name);
                let json = encode_state_json(state);
                write_string(&mut buf, &json.to_string());
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 || &data[0..4] != SMAA_MAGIC {
            return Err(Error::Protocol("missing smaa magic".into()));
        }
        let mut cursor = Cursor::new(&data[4..]);
        let kind = cursor.u32()?;
        match kind {
            STATEMAP_SUBSCRIBE_MAGIC_ID => {
                let name = cursor.string(STRING_SOFT_CAP)?;
                let interval = cursor.u32()?;
                Ok(StateMapMessage::Subscribe { name, interval })
            }
            STATEMAP_EMIT_MAGIC_ID => {
                let name = cursor.string(STRING_SOFT_CAP)?;
                let json_payload = cursor.string(STRING_HARD_CAP)?;
                Ok(StateMapMessage::Emit(decode_state_json(name, &json_payload)))
            }
            other => Err(Error::Protocol(format!(
                "unknown StateMap message kind 0x{other:08x}"
            ))),
        }
    }
}

fn encode_state_json(state: &State) -> Json {
    match &state.value {
        StateValue::Float(v) => serde_json::json!({"type": state.type_hint, "value": v}),
        StateValue::Int(v) => serde_json::json!({"type": state.type_hint, "value": v}),
        StateValue::Bool(v) => serde_json::json!({"type": state.type_hint, "state": v}),
        StateValue::Text(v) => serde_json::json!({"type": state.type_hint, "string": v}),
        StateValue::Color(v) => serde_json::json!({"type": state.type_hint, "color": v}),
    }
}

/// Decodes the inner JSON envelope of a StateMap emit message. On malformed
/// JSON, the record is delivered with `type_hint=0` and the raw string as
/// text value -- this never fails.
fn decode_state_json(name: String, raw: &str) -> State {
    let parsed: Option<Json> = serde_json::from_str(raw).ok();
    let Some(json) = parsed else {
        return State {
            name,
            value: StateValue::Text(raw.to_string()),
            type_hint: 0,
        };
    };
    let type_hint = json.get("type").and_then(Json::as_u64).unwrap_or(0) as u32;
    let value = match type_hint {
        0 | 10 | 14 => json
            .get("value")
            .and_then(|v| match v.as_i64() {
                Some(i) => Some(StateValue::Int(i)),
                None => v.as_f64().map(StateValue::Float),
            })
            .unwrap_or_else(|| StateValue::Text(raw.to_string())),
        1 | 2 | 3 => json
            .get("state")
            .and_then(Json::as_bool)
            .map(StateValue::Bool)
            .unwrap_or_else(|| StateValue::Text(raw.to_string())),
        4 | 8 => json
            .get("string")
            .and_then(Json::as_str)
            .map(|s| StateValue::Text(s.to_string()))
            .unwrap_or_else(|| StateValue::Text(raw.to_string())),
        16 => json
            .get("color")
            .and_then(Json::as_str)
            .map(|s| StateValue::Color(s.to_string()))
            .unwrap_or_else(|| StateValue::Text(raw.to_string())),
        _ => StateValue::Text(raw.to_string()),
    };
    State {
        name,
        value,
        type_hint,
    }
}

/// BeatInfo channel messages. Length prefix handled by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum BeatInfoMessage {
    StartStream,
    StopStream,
    Emit {
        clock: u64,
        players: Vec<(f64, f64, f64)>,
        timelines: Vec<f64>,
    },
}

impl BeatInfoMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            BeatInfoMessage::StartStream => buf.extend_from_slice(&BEAT_START_STREAM),
            BeatInfoMessage::StopStream => buf.extend_from_slice(&BEAT_STOP_STREAM),
            BeatInfoMessage::Emit {
                clock,
                players,
                timelines,
            } => {
                buf.extend_from_slice(&BEAT_EMIT);
                buf.extend_from_slice(&clock.to_be_bytes());
                buf.extend_from_slice(&(players.len() as u32).to_be_bytes());
                for (beat, total_beats, bpm) in players {
                    buf.extend_from_slice(&beat.to_be_bytes());
                    buf.extend_from_slice(&total_beats.to_be_bytes());
                    buf.extend_from_slice(&bpm.to_be_bytes());
                }
                for t in timelines {
                    buf.extend_from_slice(&t.to_be_bytes());
                }
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Truncated {
                expected: 4,
                actual: data.len(),
            });
        }
        let magic: [u8; 4] = data[0..4].try_into().unwrap();
        match magic {
            BEAT_START_STREAM => Ok(BeatInfoMessage::StartStream),
            BEAT_STOP_STREAM => Ok(BeatInfoMessage::StopStream),
            BEAT_EMIT => {
                let mut cursor = Cursor::new(&data[4..]);
                let clock = cursor.u64()?;
                let n = cursor.u32()? as usize;
                let mut players = Vec::with_capacity(n);
                for _ in 0..n {
                    let beat = cursor.f64()?;
                    let total_beats = cursor.f64()?;
                    let bpm = cursor.f64()?;
                    players.push((beat, total_beats, bpm));
                }
                // Decoder MUST verify that remaining payload length equals N*8.
                let expected_remaining = n * 8;
                if cursor.remaining() != expected_remaining {
                    return Err(Error::Truncated {
                        expected: expected_remaining,
                        actual: cursor.remaining(),
                    });
                }
                let mut timelines = Vec::with_capacity(n);
                for _ in 0..n {
                    timelines.push(cursor.f64()?);
                }
                Ok(BeatInfoMessage::Emit {
                    clock,
                    players,
                    timelines,
                })
            }
            other => Err(Error::Protocol(format!("unknown beat magic {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_round_trip() {
        let msg = DiscoveryMessage {
            token: Token([1; 16]),
            source: "Test".into(),
            action: ACTION_HOWDY.into(),
            software_name: "tsw".into(),
            software_version: "1.0".into(),
            port: 51338,
        };
        let encoded = msg.encode();
        let decoded = DiscoveryMessage::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn discovery_ignores_non_matching_magic() {
        let data = b"notD\x00\x00\x00\x00";
        assert_eq!(DiscoveryMessage::decode(data).unwrap(), None);
    }

    #[test]
    fn directory_message_round_trip() {
        let msgs = vec![
            DirectoryMessage::ServiceAnnounce {
                token: Token([2; 16]),
                service: "StateMap".into(),
                port: 4000,
            },
            DirectoryMessage::Reference {
                token_self: Token([3; 16]),
                token_peer: Token([4; 16]),
                reference: 0,
            },
            DirectoryMessage::ServicesRequest {
                token: Token([5; 16]),
            },
        ];
        for msg in msgs {
            let encoded = msg.encode();
            let decoded = DirectoryMessage::decode(&encoded).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn statemap_subscribe_round_trip() {
        let msg = StateMapMessage::Subscribe {
            name: "/Engine/Deck1/Play".into(),
            interval: 0,
        };
        let encoded = msg.encode();
        let decoded = StateMapMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn statemap_emit_numeric() {
        let msg = StateMapMessage::Emit(State {
            name: "/Mixer/CH1faderPosition".into(),
            value: StateValue::Float(1.0),
            type_hint: 0,
        });
        let encoded = msg.encode();
        let decoded = StateMapMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn statemap_emit_integer_round_trip() {
        let msg = StateMapMessage::Emit(State {
            name: "/Engine/Deck1/Track/BPM".into(),
            value: StateValue::Int(128),
            type_hint: 0,
        });
        let encoded = msg.encode();
        let decoded = StateMapMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn statemap_emit_malformed_json_falls_back_to_text() {
        let mut buf = Vec::new();
        buf.extend_from_slice(SMAA_MAGIC);
        buf.extend_from_slice(&STATEMAP_EMIT_MAGIC_ID.to_be_bytes());
        write_string(&mut buf, "/Some/Path");
        write_string(&mut buf, "not json");
        let decoded = StateMapMessage::decode(&buf).unwrap();
        match decoded {
            StateMapMessage::Emit(state) => {
                assert_eq!(state.type_hint, 0);
                assert_eq!(state.value, StateValue::Text("not json".into()));
            }
            _ => panic!("expected Emit"),
        }
    }

    #[test]
    fn beat_emit_round_trip() {
        let msg = BeatInfoMessage::Emit {
            clock: 42,
            players: vec![(1.0, 4.0, 120.0), (2.0, 8.0, 128.0)],
            timelines: vec![0.5, 1.5],
        };
        let encoded = msg.encode();
        let decoded = BeatInfoMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn beat_emit_truncated_timeline_is_rejected() {
        let full = BeatInfoMessage::Emit {
            clock: 42,
            players: vec![(1.0, 4.0, 120.0), (2.0, 8.0, 128.0)],
            timelines: vec![0.5, 1.5],
        }
        .encode();
        // Drop the last 8 bytes (one missing timeline f64).
        let truncated = &full[..full.len() - 8];
        let err = BeatInfoMessage::decode(truncated).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn token_msb_always_clear() {
        for _ in 0..1000 {
            let token = Token::generate();
            assert_eq!(token.0[0] & 0x80, 0);
        }
    }

    #[test]
    fn string_round_trip_within_soft_cap() {
        let s = "héllo wörld \u{1F3B5}";
        let mut buf = Vec::new();
        write_string(&mut buf, s);
        let mut cursor = Cursor::new(&buf);
        let decoded = cursor.string(STRING_SOFT_CAP).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn string_over_cap_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(STRING_SOFT_CAP as u32 + 2).to_be_bytes());
        buf.extend_from_slice(&vec![0u8; STRING_SOFT_CAP + 2]);
        let mut cursor = Cursor::new(&buf);
        let err = cursor.string(STRING_SOFT_CAP).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
