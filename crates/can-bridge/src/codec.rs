//! Translation between CAN frames and the JSON bridge message carried over MQTT.
//!
//! Wire form: `{"id": "<8 hex digits, lowercase>", "data": "<uppercase hex>", "rtr": <bool>}`.
//! Extended identifiers carry the EFF flag (bit 31) in `id`, the same convention SocketCAN
//! and gs_usb adapters use, so standard and extended frames survive a round trip.

use crate::error::DecodeError;
use can_transport::{CanFrame, CanId, MAX_DATA_LEN};
use serde::{Deserialize, Serialize};

/// Extended-frame flag merged into the wire id.
pub const EFF_FLAG: u32 = 0x8000_0000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub id: String,
    pub data: String,
    #[serde(default)]
    pub rtr: bool,
}

/// Encode a frame. Only the declared payload length is used.
pub fn encode(frame: &CanFrame) -> BridgeMessage {
    let wire_id = if frame.id.is_extended() {
        frame.id.raw() | EFF_FLAG
    } else {
        frame.id.raw()
    };
    BridgeMessage {
        id: format!("{wire_id:08x}"),
        data: hex::encode_upper(frame.payload()),
        rtr: frame.rtr,
    }
}

pub fn decode(msg: &BridgeMessage) -> Result<CanFrame, DecodeError> {
    let id = decode_id(&msg.id)?;
    if msg.data.len() % 2 != 0 {
        return Err(DecodeError::Data(msg.data.clone()));
    }
    if msg.data.len() > MAX_DATA_LEN * 2 {
        return Err(DecodeError::DataTooLong(msg.data.len() / 2));
    }
    let data = hex::decode(&msg.data).map_err(|_| DecodeError::Data(msg.data.clone()))?;
    let mut frame = CanFrame::new(id, &data).ok_or(DecodeError::DataTooLong(data.len()))?;
    frame.rtr = msg.rtr;
    Ok(frame)
}

fn decode_id(text: &str) -> Result<CanId, DecodeError> {
    if text.is_empty() || text.len() > 8 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DecodeError::Id(text.to_string()));
    }
    let raw = u32::from_str_radix(text, 16).map_err(|_| DecodeError::Id(text.to_string()))?;
    let id = if raw & EFF_FLAG != 0 {
        CanId::extended(raw & !EFF_FLAG)
    } else if raw <= CanId::STANDARD_MAX {
        u16::try_from(raw).ok().and_then(CanId::standard)
    } else {
        // Producers that omit the flag still mean an extended id
        CanId::extended(raw)
    };
    id.ok_or(DecodeError::IdRange(raw))
}

/// Serialize a frame into the MQTT payload.
pub fn to_payload(frame: &CanFrame) -> Vec<u8> {
    let msg = encode(frame);
    // A struct of two strings and a bool always serializes
    serde_json::to_vec(&msg).unwrap_or_default()
}

/// Parse an MQTT payload into a frame.
pub fn from_payload(payload: &[u8]) -> Result<CanFrame, DecodeError> {
    let msg: BridgeMessage =
        serde_json::from_slice(payload).map_err(|e| DecodeError::Payload(e.to_string()))?;
    decode(&msg)
}
