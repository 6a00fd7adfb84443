//! Wire codec for the servo server protocol
//!
//! Every message is an ASCII frame of the form `!s-<body>-e!` with binary
//! fields embedded at fixed offsets. The codec is stateless: client-side
//! helpers build queries and classify responses, server-side helpers build
//! responses and parse queries. Classification never fails; anything that is
//! not an ACK, NACK or info frame comes back as [`Frame::Corrupt`] and the
//! caller decides what that means.
//!
//! Offsets that matter:
//! - byte [`PAYLOAD_INDEX`] is the wildcard byte of ACK/NACK/info templates
//!   (NACK reason, info servo count, movement item count)
//! - info positions start at [`INFO_DATA_START`] and occupy every second byte
//! - positions travel with a +1 offset so that 0 can mean "no update"

use crate::error::{DecodeError, NackReason};
use crate::{ServoCommand, MAX_SERVOS, MAX_SERVO_POSITION};

pub const LOGIN: &[u8] = b"!s-Client_here-e!";
pub const FETCH_INFO: &[u8] = b"!s-iMCU-e!";
pub const SELECT_PREFIX: &[u8] = b"!s-sMCU-";
pub const MOVEMENT_PREFIX: &[u8] = b"!s-SRVP-c-";
pub const QUERY_TAIL: &[u8] = b"-e!";
pub const MOVEMENT_TAIL: &[u8] = b"e!";

pub const ACK_TEMPLATE: &[u8; 12] = b"!s-_ACK-c-e!";
pub const NACK_TEMPLATE: &[u8; 12] = b"!s-NACK-c-e!";
pub const INFO_TEMPLATE: &[u8; 12] = b"!s-iMCU-c-e!";

/// Wildcard byte inside the fixed templates
pub const PAYLOAD_INDEX: usize = 8;
/// First position byte of an info frame
pub const INFO_DATA_START: usize = PAYLOAD_INDEX + 2;

const ITEM_SEPARATOR: u8 = b':';
const FIELD_SEPARATOR: u8 = b'-';

/// Classification of a single received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nack(NackReason),
    Info,
    Corrupt,
}

/// Decoded info response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoFrame {
    pub servo_count: u8,
    /// Raw wire positions, +1 offset kept
    pub positions: Vec<u8>,
}

/// Queries a server can receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Login,
    SelectMcu(String),
    FetchInfo,
    Movement(Vec<ServoCommand>),
}

pub fn encode_login() -> Vec<u8> {
    LOGIN.to_vec()
}

pub fn encode_select_mcu(name: &str) -> Vec<u8> {
    let mut query = Vec::with_capacity(SELECT_PREFIX.len() + name.len() + QUERY_TAIL.len());
    query.extend_from_slice(SELECT_PREFIX);
    query.extend_from_slice(name.as_bytes());
    query.extend_from_slice(QUERY_TAIL);
    query
}

pub fn encode_fetch_info() -> Vec<u8> {
    FETCH_INFO.to_vec()
}

/// Builds an `SRVP` query from a pending-position buffer
///
/// `pending[id]` is the encoded (+1) position for servo `id`; zero entries are
/// skipped. The number of emitted items overwrites the template byte at
/// [`PAYLOAD_INDEX`]. Entries past [`MAX_SERVOS`] are ignored.
pub fn encode_movement(pending: &[u8]) -> Vec<u8> {
    let pending = &pending[..pending.len().min(MAX_SERVOS)];
    let mut query = Vec::with_capacity(MOVEMENT_PREFIX.len() + pending.len() * 4 + 2);
    query.extend_from_slice(MOVEMENT_PREFIX);

    let mut count: u8 = 0;
    for (servo_id, &position) in pending.iter().enumerate() {
        if position == 0 {
            continue;
        }
        query.push(servo_id as u8 + 1);
        query.push(ITEM_SEPARATOR);
        query.push(position);
        query.push(FIELD_SEPARATOR);
        count += 1;
    }

    query[PAYLOAD_INDEX] = count;
    query.extend_from_slice(MOVEMENT_TAIL);
    query
}

/// Exact-length template match ignoring the payload byte
fn matches_template(frame: &[u8], template: &[u8; 12]) -> bool {
    frame.len() == template.len()
        && frame
            .iter()
            .zip(template.iter())
            .enumerate()
            .all(|(i, (got, want))| i == PAYLOAD_INDEX || got == want)
}

pub fn is_ack(frame: &[u8]) -> bool {
    matches_template(frame, ACK_TEMPLATE)
}

pub fn is_nack(frame: &[u8]) -> bool {
    matches_template(frame, NACK_TEMPLATE)
}

/// Reason carried by a NACK frame, `None` if the frame is not a NACK
pub fn nack_reason(frame: &[u8]) -> Option<NackReason> {
    is_nack(frame).then(|| NackReason::from(frame[PAYLOAD_INDEX]))
}

/// Info frames have a variable-length body: the template head is matched at
/// the start and its tail is anchored at the end of the frame.
pub fn is_info_frame(frame: &[u8]) -> bool {
    if frame.len() < INFO_TEMPLATE.len() {
        return false;
    }
    let offset = frame.len() - INFO_TEMPLATE.len();

    INFO_TEMPLATE
        .iter()
        .enumerate()
        .all(|(i, want)| match i {
            PAYLOAD_INDEX => true,
            i if i > PAYLOAD_INDEX => frame[offset + i] == *want,
            i => frame[i] == *want,
        })
}

pub fn classify(frame: &[u8]) -> Frame {
    if is_ack(frame) {
        Frame::Ack
    } else if let Some(reason) = nack_reason(frame) {
        Frame::Nack(reason)
    } else if is_info_frame(frame) {
        Frame::Info
    } else {
        Frame::Corrupt
    }
}

/// Minimum frame length for an info frame reporting `servo_count` servos
pub fn info_frame_len(servo_count: usize) -> usize {
    INFO_DATA_START + 2 * servo_count + QUERY_TAIL.len() - 1
}

/// Decodes servo count and raw positions from an info frame
///
/// Assumes the frame already classified as [`Frame::Info`]. Fails when the
/// count is zero, exceeds [`MAX_SERVOS`], or the frame is too short to hold a
/// position slot per servo plus the trailing `-e!`.
pub fn decode_info_frame(frame: &[u8]) -> Result<InfoFrame, DecodeError> {
    let servo_count = *frame.get(PAYLOAD_INDEX).ok_or(DecodeError::Truncated {
        expected: PAYLOAD_INDEX + 1,
        actual: frame.len(),
    })?;

    if servo_count == 0 {
        return Err(DecodeError::ZeroServoCount);
    }
    if servo_count as usize > MAX_SERVOS {
        return Err(DecodeError::TooManyServos {
            count: servo_count as usize,
            limit: MAX_SERVOS,
        });
    }

    let expected = info_frame_len(servo_count as usize);
    if frame.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: frame.len(),
        });
    }

    let positions = (0..servo_count as usize)
        .map(|i| frame[INFO_DATA_START + 2 * i])
        .collect();

    Ok(InfoFrame {
        servo_count,
        positions,
    })
}

pub fn encode_ack() -> Vec<u8> {
    ACK_TEMPLATE.to_vec()
}

pub fn encode_nack(reason: NackReason) -> Vec<u8> {
    let mut frame = NACK_TEMPLATE.to_vec();
    frame[PAYLOAD_INDEX] = reason.code();
    frame
}

/// Builds an info frame from raw (+1 offset) positions
///
/// Layout: `!s-iMCU-<count>` then one `<id+1><position>` pair per servo, then
/// `-e!`. Positions past [`MAX_SERVOS`] are ignored.
pub fn encode_info_frame(positions: &[u8]) -> Vec<u8> {
    let positions = &positions[..positions.len().min(MAX_SERVOS)];
    let mut frame = Vec::with_capacity(info_frame_len(positions.len()));
    frame.extend_from_slice(&INFO_TEMPLATE[..PAYLOAD_INDEX]);
    frame.push(positions.len() as u8);
    for (servo_id, &position) in positions.iter().enumerate() {
        frame.push(servo_id as u8 + 1);
        frame.push(position);
    }
    frame.extend_from_slice(QUERY_TAIL);
    frame
}

/// Splits the first complete query off a server-side receive buffer
///
/// Every query ends in `e!` and that pair cannot occur inside a movement item
/// (`<id>:<pos>-`), so the first occurrence terminates the query.
pub fn take_query(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end = buffer
        .windows(MOVEMENT_TAIL.len())
        .position(|w| w == MOVEMENT_TAIL)?
        + MOVEMENT_TAIL.len();
    Some(buffer.drain(..end).collect())
}

/// Parses a client query; `None` if it matches no known query shape
pub fn decode_query(bytes: &[u8]) -> Option<Query> {
    if bytes == LOGIN {
        return Some(Query::Login);
    }
    if bytes == FETCH_INFO {
        return Some(Query::FetchInfo);
    }
    if let Some(name) = bytes
        .strip_prefix(SELECT_PREFIX)
        .and_then(|rest| rest.strip_suffix(QUERY_TAIL))
    {
        return String::from_utf8(name.to_vec()).ok().map(Query::SelectMcu);
    }
    if bytes.starts_with(&MOVEMENT_PREFIX[..PAYLOAD_INDEX]) {
        return decode_movement(bytes).map(Query::Movement);
    }
    None
}

/// Parses the item list of an `SRVP` query into user-facing commands
pub fn decode_movement(bytes: &[u8]) -> Option<Vec<ServoCommand>> {
    let count = *bytes.get(PAYLOAD_INDEX)? as usize;
    let items_start = MOVEMENT_PREFIX.len();
    let items_end = items_start + count * 4;

    if bytes.len() != items_end + MOVEMENT_TAIL.len() || !bytes.ends_with(MOVEMENT_TAIL) {
        return None;
    }
    if bytes[PAYLOAD_INDEX + 1] != FIELD_SEPARATOR {
        return None;
    }

    bytes[items_start..items_end]
        .chunks_exact(4)
        .map(|item| match item {
            &[id, ITEM_SEPARATOR, position, FIELD_SEPARATOR]
                if id > 0 && position > 0 && position - 1 <= MAX_SERVO_POSITION =>
            {
                Some(ServoCommand::new(id - 1, position - 1))
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_fixture(user_positions: &[u8]) -> Vec<u8> {
        let raw: Vec<u8> = user_positions.iter().map(|p| p + 1).collect();
        encode_info_frame(&raw)
    }

    #[test]
    fn test_literal_queries() {
        assert_eq!(encode_login(), b"!s-Client_here-e!");
        assert_eq!(encode_fetch_info(), b"!s-iMCU-e!");
        assert_eq!(encode_select_mcu("smartMCU"), b"!s-sMCU-smartMCU-e!");
    }

    #[test]
    fn test_encode_movement_single_item() {
        let mut pending = vec![0u8; 2];
        pending[0] = 46;

        let query = encode_movement(&pending);
        let mut expected = b"!s-SRVP-".to_vec();
        expected.extend_from_slice(&[1, b'-', 1, b':', 46, b'-', b'e', b'!']);
        assert_eq!(query, expected);
    }

    #[test]
    fn test_encode_movement_skips_unchanged() {
        let pending = [0u8, 91, 0, 180];
        let query = encode_movement(&pending);
        assert_eq!(query[PAYLOAD_INDEX], 2);
        assert_eq!(&query[10..14], &[2, b':', 91, b'-']);
        assert_eq!(&query[14..18], &[4, b':', 180, b'-']);
        assert!(query.ends_with(b"-e!"));
    }

    #[test]
    fn test_encode_movement_empty_buffer() {
        let query = encode_movement(&[0, 0, 0]);
        assert_eq!(query[PAYLOAD_INDEX], 0);
        assert_eq!(query.len(), MOVEMENT_PREFIX.len() + MOVEMENT_TAIL.len());
    }

    #[test]
    fn test_encoders_cap_at_max_servos() {
        let oversized = vec![91u8; 300];

        let query = encode_movement(&oversized);
        assert_eq!(query[PAYLOAD_INDEX] as usize, MAX_SERVOS);
        assert_eq!(decode_movement(&query).map(|items| items.len()), Some(MAX_SERVOS));

        let frame = encode_info_frame(&oversized);
        assert_eq!(frame.len(), info_frame_len(MAX_SERVOS));
        let info = decode_info_frame(&frame).unwrap();
        assert_eq!(info.servo_count as usize, MAX_SERVOS);
    }

    #[test]
    fn test_ack_wildcard_byte() {
        assert!(is_ack(b"!s-_ACK-c-e!"));
        assert!(is_ack(b"!s-_ACK-\x00-e!"));
        assert!(!is_ack(b"!s-_ACK-c-e"));
        assert!(!is_ack(b"!s-_ACK-c-e!!"));
        assert!(!is_ack(b"!s-NACK-c-e!"));
    }

    #[test]
    fn test_nack_carries_reason() {
        let frame = encode_nack(NackReason::NoActiveMcu);
        assert!(is_nack(&frame));
        assert_eq!(frame[PAYLOAD_INDEX], 249);
        assert_eq!(nack_reason(&frame), Some(NackReason::NoActiveMcu));
        assert_eq!(classify(&frame), Frame::Nack(NackReason::NoActiveMcu));
        assert_eq!(nack_reason(&encode_ack()), None);
    }

    #[test]
    fn test_classify_single_byte_corruption() {
        let ack = encode_ack();
        for i in 0..ack.len() {
            let mut corrupted = ack.clone();
            corrupted[i] ^= 0x20;
            if i == PAYLOAD_INDEX {
                assert_eq!(classify(&corrupted), Frame::Ack);
            } else {
                assert_eq!(classify(&corrupted), Frame::Corrupt, "byte {}", i);
            }
        }
    }

    #[test]
    fn test_info_frame_classification() {
        let frame = info_fixture(&[10, 20, 30]);
        assert!(is_info_frame(&frame));
        assert_eq!(classify(&frame), Frame::Info);
        assert!(!is_info_frame(b"!s-iMCU-e!"));
        assert!(!is_info_frame(&encode_ack()));
    }

    #[test]
    fn test_decode_info_frame() {
        let raw = encode_info_frame(&[10, 20, 30]);
        let info = decode_info_frame(&raw).unwrap();
        assert_eq!(info.servo_count, 3);
        assert_eq!(info.positions, vec![10, 20, 30]);
    }

    #[test]
    fn test_decode_info_frame_truncated() {
        let mut raw = encode_info_frame(&[10, 20, 30]);
        raw.pop();
        assert_eq!(
            decode_info_frame(&raw),
            Err(DecodeError::Truncated {
                expected: 18,
                actual: 17
            })
        );
    }

    #[test]
    fn test_decode_info_frame_zero_servos() {
        let raw = encode_info_frame(&[]);
        assert!(is_info_frame(&raw));
        assert_eq!(decode_info_frame(&raw), Err(DecodeError::ZeroServoCount));
    }

    #[test]
    fn test_decode_info_frame_count_beyond_payload() {
        let mut raw = encode_info_frame(&[10, 20]);
        raw[PAYLOAD_INDEX] = 5;
        assert!(matches!(
            decode_info_frame(&raw),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_queries() {
        assert_eq!(decode_query(LOGIN), Some(Query::Login));
        assert_eq!(decode_query(FETCH_INFO), Some(Query::FetchInfo));
        assert_eq!(
            decode_query(&encode_select_mcu("smartMCU")),
            Some(Query::SelectMcu("smartMCU".to_string()))
        );
        assert_eq!(decode_query(b"!s-what-e!"), None);
    }

    #[test]
    fn test_decode_movement_query() {
        let query = encode_movement(&[46, 0, 180]);
        assert_eq!(
            decode_query(&query),
            Some(Query::Movement(vec![
                ServoCommand::new(0, 45),
                ServoCommand::new(2, 179)
            ]))
        );
    }

    #[test]
    fn test_take_query_splits_coalesced_reads() {
        let mut buffer = encode_login();
        buffer.extend_from_slice(&encode_select_mcu("smartMCU"));
        buffer.extend_from_slice(b"!s-iM");

        assert_eq!(take_query(&mut buffer), Some(encode_login()));
        assert_eq!(take_query(&mut buffer), Some(encode_select_mcu("smartMCU")));
        assert_eq!(take_query(&mut buffer), None);
        assert_eq!(buffer, b"!s-iM");
    }

    #[test]
    fn test_decode_movement_rejects_bad_count() {
        let mut query = encode_movement(&[46, 91]);
        query[PAYLOAD_INDEX] = 3;
        assert_eq!(decode_movement(&query), None);
    }

    mod props {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            /// Any single-byte change outside the payload byte breaks ACK/NACK matching
            #[test]
            fn single_byte_corruption_falls_through(index in 0usize..12, flip in 1u8..=255) {
                prop_assume!(index != PAYLOAD_INDEX);
                let mut nack = encode_nack(NackReason::McuOffline);
                nack[index] ^= flip;
                prop_assert!(!is_nack(&nack));

                let mut ack = encode_ack();
                ack[index] ^= flip;
                prop_assert!(!is_ack(&ack));
            }

            /// The payload byte never affects classification of ACK/NACK
            #[test]
            fn payload_byte_is_wildcard(payload in any::<u8>()) {
                let mut ack = encode_ack();
                ack[PAYLOAD_INDEX] = payload;
                prop_assert_eq!(classify(&ack), Frame::Ack);

                let mut nack = encode_nack(NackReason::InvalidQuery);
                nack[PAYLOAD_INDEX] = payload;
                prop_assert_eq!(classify(&nack), Frame::Nack(NackReason::from(payload)));
            }

            /// Info frames carry every servo position back out unchanged
            #[test]
            fn info_frame_positions_survive(positions in prop::collection::vec(1u8..=180, 1..=MAX_SERVOS)) {
                let frame = encode_info_frame(&positions);
                prop_assert!(is_info_frame(&frame));
                let info = decode_info_frame(&frame).unwrap();
                prop_assert_eq!(info.servo_count as usize, positions.len());
                prop_assert_eq!(info.positions, positions);
            }

            /// Movement queries list exactly the non-zero pending entries
            #[test]
            fn movement_lists_pending_entries(pending in prop::collection::vec(0u8..=180, 1..=MAX_SERVOS)) {
                let query = encode_movement(&pending);
                let expected = pending.iter().filter(|p| **p != 0).count();
                prop_assert_eq!(query[PAYLOAD_INDEX] as usize, expected);

                let commands = decode_movement(&query).unwrap();
                prop_assert_eq!(commands.len(), expected);
                for cmd in commands {
                    prop_assert_eq!(pending[cmd.servo_id as usize], cmd.encoded_position());
                }
            }
        }
    }
}
