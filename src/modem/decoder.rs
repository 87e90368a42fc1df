//! # Receive-Event Decoder
//!
//! Extracts and validates the raw sensor code carried by a receive-event
//! line such as `+EVT:RXP2P:-52:9:03FF`.

use super::protocol::RX_EVENT_PREFIX;
use crate::error::FrameError;

/// Exact number of hex digits in a frame payload.
pub const PAYLOAD_HEX_LEN: usize = 4;

/// Largest valid raw sensor code.
pub const RAW_VALUE_MAX: u16 = 1023;

/// Extract the payload of a receive-event line.
///
/// The payload is everything after the final `:`, trimmed.
///
/// # Errors
///
/// - [`FrameError::NotDataEvent`] if the line is not a receive event
/// - [`FrameError::MissingPayload`] if there is nothing after the prefix
pub fn extract_payload(line: &str) -> Result<&str, FrameError> {
    let line = line.trim();
    let rest = line
        .strip_prefix(RX_EVENT_PREFIX)
        .ok_or(FrameError::NotDataEvent)?;

    let idx = rest.rfind(':').ok_or(FrameError::MissingPayload)?;
    let payload = rest[idx + 1..].trim();
    if payload.is_empty() {
        return Err(FrameError::MissingPayload);
    }
    Ok(payload)
}

/// Decode a 4-digit hex payload into a raw sensor code.
///
/// Upper- and lower-case digits are accepted.
///
/// # Errors
///
/// - [`FrameError::MalformedFrame`] unless the payload is exactly
///   [`PAYLOAD_HEX_LEN`] hex digits
/// - [`FrameError::OutOfRangeValue`] if the value exceeds [`RAW_VALUE_MAX`]
pub fn decode_payload(payload: &str) -> Result<u16, FrameError> {
    if payload.len() != PAYLOAD_HEX_LEN || !payload.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(FrameError::MalformedFrame(payload.to_string()));
    }

    let value = u16::from_str_radix(payload, 16)
        .map_err(|_| FrameError::MalformedFrame(payload.to_string()))?;

    if value > RAW_VALUE_MAX {
        return Err(FrameError::OutOfRangeValue(value));
    }
    Ok(value)
}

/// Decode a complete receive-event line into a raw sensor code.
///
/// # Examples
///
/// ```
/// use tank_gateway::modem::decoder::decode_frame;
/// use tank_gateway::error::FrameError;
///
/// assert_eq!(decode_frame("+EVT:RXP2P:03FF"), Ok(1023));
/// assert_eq!(decode_frame("+EVT:RXP2P:-61:5:01a4"), Ok(420));
/// assert!(matches!(decode_frame("+EVT:RXP2P:ABC"), Err(FrameError::MalformedFrame(_))));
/// assert_eq!(decode_frame("+EVT:RXP2P:0400"), Err(FrameError::OutOfRangeValue(1024)));
/// ```
pub fn decode_frame(line: &str) -> Result<u16, FrameError> {
    extract_payload(line).and_then(decode_payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_bounds() {
        assert_eq!(decode_frame("+EVT:RXP2P:0000"), Ok(0));
        assert_eq!(decode_frame("+EVT:RXP2P:03FF"), Ok(1023));
        assert_eq!(
            decode_frame("+EVT:RXP2P:FFFF"),
            Err(FrameError::OutOfRangeValue(0xFFFF))
        );
    }

    #[test]
    fn test_payload_after_last_delimiter_with_whitespace() {
        assert_eq!(decode_frame("+EVT:RXP2P:-45:8:0200 \r"), Ok(512));
        assert_eq!(decode_frame("+EVT:RXP2P: 0010"), Ok(16));
    }

    #[test]
    fn test_lower_case_hex() {
        assert_eq!(decode_frame("+EVT:RXP2P:03ff"), Ok(1023));
    }

    #[test]
    fn test_wrong_length_is_malformed() {
        assert_eq!(
            decode_frame("+EVT:RXP2P:ABC"),
            Err(FrameError::MalformedFrame("ABC".to_string()))
        );
        assert_eq!(
            decode_frame("+EVT:RXP2P:003FF"),
            Err(FrameError::MalformedFrame("003FF".to_string()))
        );
    }

    #[test]
    fn test_non_hex_is_malformed() {
        assert!(matches!(
            decode_frame("+EVT:RXP2P:03G0"),
            Err(FrameError::MalformedFrame(_))
        ));
        // Sign characters are accepted by from_str_radix but not here
        assert!(matches!(
            decode_frame("+EVT:RXP2P:+3FF"),
            Err(FrameError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_not_data_event() {
        assert_eq!(decode_frame("OK"), Err(FrameError::NotDataEvent));
        assert_eq!(
            decode_frame("+EVT:TXP2P DONE"),
            Err(FrameError::NotDataEvent)
        );
    }

    #[test]
    fn test_missing_payload() {
        assert_eq!(decode_frame("+EVT:RXP2P"), Err(FrameError::MissingPayload));
        assert_eq!(decode_frame("+EVT:RXP2P:"), Err(FrameError::MissingPayload));
    }
}
