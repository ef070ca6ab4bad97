// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The control-channel wire protocol (spec.md §4.1, §6).
//!
//! Every message is `serde_json`-encoded then terminated with the single
//! byte `0x1E` (ASCII record separator). Both peers accumulate bytes until
//! they see `0x1E`, then decode the accumulated record. This is the Rust
//! equivalent of `original_source/messaging/messaging.py`'s
//! `Message.serialize`/`deserialize`, swapping YAML for JSON and the
//! untyped `{type, arg}` dict for a proper tagged enum (spec.md §9
//! "Dynamic message arg").

use std::path::PathBuf;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::types::{AgentStatus, GpsFix, HwStatus};

/// The record separator terminating every encoded message.
pub const SEPARATOR: u8 = 0x1E;

/// Device-typed payload carried by a `DATA` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DataPayload {
    GpsFix(GpsFix),
    Button(String),
    DatabasePath(PathBuf),
}

/// Aggregate or per-device system state broadcast to the panel agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SysState {
    Online,
    Offline,
    Error,
    CaptureOn,
    CaptureOff,
    CapturePaused,
    ExtDriveInUse,
    ExtDriveNotInUse,
    ExtDriveFull,
}

/// The tagged control message exchanged over the loopback socket (spec.md §3 "Message").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "arg")]
pub enum Message {
    StartCapture,
    EndCapture,
    NewCapture(PathBuf),
    Quit,
    QueryAgentState,
    QueryHwState,
    AgentState(AgentStatus),
    HwState(HwStatus),
    SysState(SysState),
    DeviceState { device: String, status: HwStatus },
    Data(DataPayload),
}

/// Errors from decoding a malformed wire record (spec.md §4.1 "Contract").
#[derive(Debug)]
pub struct ProtocolError(pub String);

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed control message: {}", self.0)
    }
}

impl std::error::Error for ProtocolError {}

/// Encode a message into its on-wire byte representation, including the
/// trailing separator. Panics only if `msg` somehow serializes to bytes
/// containing the separator, which `encode_checked` guards against instead.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(msg).unwrap_or_default();
    bytes.push(SEPARATOR);
    bytes
}

/// Encode a message, rejecting it if the payload happens to contain the
/// separator byte (spec.md §3 invariant: "messages MUST NOT contain that
/// byte in their payload").
pub fn encode_checked(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| ProtocolError(format!("failed to serialize message: {e}")))?;
    if payload.contains(&SEPARATOR) {
        return Err(ProtocolError(
            "encoded payload contains the record separator byte".to_owned(),
        ));
    }
    let mut bytes = payload;
    bytes.push(SEPARATOR);
    Ok(bytes)
}

/// Decode a single record (without its trailing separator) into a `Message`.
pub fn decode(record: &[u8]) -> Result<Message, ProtocolError> {
    serde_json::from_slice(record).map_err(|e| ProtocolError(e.to_string()))
}

/// Incremental frame accumulator used by both the agent runtime's control
/// reader and the manager's proxy receive loop. Feed it bytes as they
/// arrive from the socket; each call to [`Framer::push`] returns any
/// complete records found, reassembling records split across reads and
/// resynchronizing on the next separator after a malformed record.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Feed newly-read bytes in; returns every message successfully decoded
    /// from the records completed by this push, in arrival order. A record
    /// that fails to decode is dropped (logged by the caller) — the
    /// separator byte itself is still the resync point, so the next record
    /// starts cleanly. Completed records are split off the front of `buf`
    /// with [`BytesMut::split_to`], which is O(1) rather than re-copying
    /// whatever bytes remain after it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<Message, ProtocolError>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == SEPARATOR) {
            let record = self.buf.split_to(pos + 1);
            out.push(decode(&record[..record.len() - 1]));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::StartCapture,
            Message::EndCapture,
            Message::NewCapture(PathBuf::from("/data/001/2026.01.01/10.00.00/0001")),
            Message::Quit,
            Message::QueryAgentState,
            Message::QueryHwState,
            Message::AgentState(AgentStatus::Capturing),
            Message::HwState(HwStatus::Warning),
            Message::SysState(SysState::ExtDriveInUse),
            Message::DeviceState { device: "gps".into(), status: HwStatus::Nominal },
            Message::Data(DataPayload::Button("bSingleButton".into())),
        ]
    }

    #[test]
    fn round_trip_is_identity() {
        for msg in sample_messages() {
            let bytes = encode(&msg);
            assert_eq!(*bytes.last().unwrap(), SEPARATOR);
            let record = &bytes[..bytes.len() - 1];
            let decoded = decode(record).expect("decode");
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn separator_never_appears_inside_payload() {
        for msg in sample_messages() {
            let bytes = encode_checked(&msg).expect("encode_checked");
            assert_eq!(bytes.iter().filter(|&&b| b == SEPARATOR).count(), 1);
            assert_eq!(*bytes.last().unwrap(), SEPARATOR);
        }
    }

    #[test]
    fn framer_reassembles_across_arbitrary_chunk_boundaries() {
        let msgs = sample_messages();
        let mut all_bytes = Vec::new();
        for msg in &msgs {
            all_bytes.extend(encode(msg));
        }

        // Feed in awkward, non-record-aligned chunk sizes.
        let mut framer = Framer::new();
        let mut decoded = Vec::new();
        for chunk in all_bytes.chunks(3) {
            for result in framer.push(chunk) {
                decoded.push(result.expect("decode"));
            }
        }

        assert_eq!(decoded, msgs);
    }

    #[test]
    fn malformed_record_is_dropped_and_sync_recovers() {
        let mut framer = Framer::new();
        let mut stream = Vec::new();
        stream.extend(b"not json at all");
        stream.push(SEPARATOR);
        stream.extend(encode(&Message::Quit));

        let results = framer.push(&stream);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap(), &Message::Quit);
    }

    #[test]
    fn fuzz_like_round_trip_over_many_messages() {
        let variants = sample_messages();
        let mut framer = Framer::new();
        let mut expected = Vec::new();
        let mut stream = Vec::new();
        for i in 0..10_000u32 {
            let msg = variants[(i as usize) % variants.len()].clone();
            stream.extend(encode(&msg));
            expected.push(msg);
        }

        let mut decoded = Vec::new();
        for chunk in stream.chunks(17) {
            for result in framer.push(chunk) {
                decoded.push(result.expect("decode"));
            }
        }
        assert_eq!(decoded, expected);
    }
}
