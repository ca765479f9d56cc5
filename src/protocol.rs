//! Wire codec for the chamber line protocol.
//!
//! The protocol is ASCII, newline-terminated, one command per line and one
//! response per line:
//!
//! - `PING` → `OK`
//! - `SETALL d0 d1 d2 d3 d4 d5` (six integers, 0–4095) → `OK` | `ERR:<reason>`
//! - `FAN_SET p` (integer 0–100) → `OK` | `ERR:<reason>`
//!
//! Encoding and response classification are pure and synchronous - no I/O,
//! no state. The link layer owns timeouts and retries.

/// Number of PWM channels per chamber module.
pub const CHANNEL_COUNT: usize = 6;

/// Maximum duty-cycle value accepted by the firmware (12-bit PWM).
pub const DUTY_MAX: u16 = 4095;

/// Serial line rate the firmware listens at (8N1 assumed).
pub const BAUD_RATE: u32 = 115_200;

/// A classified response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The firmware acknowledged the command.
    Ack,
    /// A well-formed `ERR:` answer; payload is the trimmed remainder.
    Board(String),
    /// A non-empty line that is neither `OK` nor `ERR:`.
    Unexpected(String),
    /// An empty read - the read timeout elapsed with no line.
    Empty,
}

/// Encode a `SETALL` command from a per-channel duty vector.
///
/// Values are expected to already be within `[0, DUTY_MAX]`; validation
/// happens at command construction, before the codec is reached.
pub fn encode_set_channels(duty: &[u16; CHANNEL_COUNT]) -> Vec<u8> {
    let mut line = String::with_capacity(40);
    line.push_str("SETALL");
    for d in duty {
        line.push(' ');
        line.push_str(&d.to_string());
    }
    line.push('\n');
    line.into_bytes()
}

/// Encode a `FAN_SET` command.
pub fn encode_fan_set(percent: u8) -> Vec<u8> {
    format!("FAN_SET {}\n", percent).into_bytes()
}

/// Encode a `PING` command.
pub fn encode_ping() -> Vec<u8> {
    b"PING\n".to_vec()
}

/// Classify a raw response line.
///
/// `ERR:` takes precedence so an error payload that happens to mention `OK`
/// is still reported as a board error.
pub fn classify_response(raw: &str) -> Response {
    let line = raw.trim();
    if line.is_empty() {
        return Response::Empty;
    }
    if let Some(reason) = line.strip_prefix("ERR:") {
        return Response::Board(reason.trim().to_string());
    }
    if line.split_whitespace().any(|token| token == "OK") {
        return Response::Ack;
    }
    Response::Unexpected(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_setall_line() {
        let bytes = encode_set_channels(&[0, 100, 4095, 7, 42, 3276]);
        assert_eq!(bytes, b"SETALL 0 100 4095 7 42 3276\n");
    }

    #[test]
    fn encodes_fan_and_ping() {
        assert_eq!(encode_fan_set(55), b"FAN_SET 55\n");
        assert_eq!(encode_ping(), b"PING\n");
    }

    #[test]
    fn classifies_ok_variants() {
        assert_eq!(classify_response("OK"), Response::Ack);
        assert_eq!(classify_response("OK\r"), Response::Ack);
        assert_eq!(classify_response("SETALL OK"), Response::Ack);
    }

    #[test]
    fn classifies_board_errors() {
        assert_eq!(
            classify_response("ERR: bad channel count"),
            Response::Board("bad channel count".into())
        );
        assert_eq!(classify_response("ERR:"), Response::Board(String::new()));
        // ERR takes precedence even if the payload mentions OK
        assert_eq!(
            classify_response("ERR: OK flag stuck"),
            Response::Board("OK flag stuck".into())
        );
    }

    #[test]
    fn classifies_noise_and_empty() {
        assert_eq!(
            classify_response("boot banner v1.2"),
            Response::Unexpected("boot banner v1.2".into())
        );
        assert_eq!(classify_response(""), Response::Empty);
        assert_eq!(classify_response("  \r\n"), Response::Empty);
    }
}
