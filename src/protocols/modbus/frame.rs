//! MBAP framing for Modbus TCP
//!
//! The MBAP header is 7 bytes: transaction id (u16 be), protocol id
//! (u16 be, always 0), length (u16 be, counting unit id + PDU) and the
//! unit id. Responses are validated against the in-flight transaction id
//! and expected function code; rejected frames are hex-dumped at debug
//! level.

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use crate::error::{AcqSrvError, Result};

use super::constants::{MAX_MBAP_LENGTH, MBAP_PREFIX_LEN, PROTOCOL_ID};
use super::pdu::ModbusPdu;

/// Wrapping 16-bit transaction id counter; zero is skipped so an
/// uninitialized id never correlates.
#[derive(Debug)]
pub struct TransactionId {
    next: u16,
}

impl TransactionId {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Take the next id, wrapping around and skipping zero.
    pub fn next(&mut self) -> u16 {
        let id = self.next;
        self.next = match self.next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a request frame: MBAP header followed by the PDU.
pub fn encode_request(pdu: &ModbusPdu, unit_id: u8, tx_id: u16) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_PREFIX_LEN + 1 + pdu.len());
    frame.put_u16(tx_id);
    frame.put_u16(PROTOCOL_ID);
    frame.put_u16((1 + pdu.len()) as u16);
    frame.put_u8(unit_id);
    frame.put_slice(pdu.as_slice());
    frame
}

/// Parse the 6-byte MBAP prefix, returning `(tx_id, body_len)` where
/// `body_len` counts the unit id plus the PDU.
pub fn parse_mbap_prefix(prefix: &[u8]) -> Result<(u16, usize)> {
    if prefix.len() < MBAP_PREFIX_LEN {
        return Err(AcqSrvError::ProtocolError(format!(
            "MBAP prefix too short: {} bytes",
            prefix.len()
        )));
    }

    let mut buf = prefix;
    let tx_id = buf.get_u16();
    let protocol_id = buf.get_u16();
    let length = usize::from(buf.get_u16());

    if protocol_id != PROTOCOL_ID {
        debug!("Rejected frame with protocol id {:#06x}: {}", protocol_id, hex::encode(prefix));
        return Err(AcqSrvError::ProtocolError(format!(
            "Invalid protocol id: {protocol_id:#06x}"
        )));
    }
    if length == 0 || length > MAX_MBAP_LENGTH {
        debug!("Rejected frame with length {}: {}", length, hex::encode(prefix));
        return Err(AcqSrvError::ProtocolError(format!(
            "Invalid MBAP length: {length}"
        )));
    }

    Ok((tx_id, length))
}

/// Decode a complete response frame.
///
/// Rejects wrong protocol ids, mismatched transaction ids and truncated
/// frames; exception responses surface as [`AcqSrvError::ModbusException`].
pub fn decode_response(frame: &[u8], expected_tx_id: u16, expected_fc: u8) -> Result<ModbusPdu> {
    let (tx_id, body_len) = parse_mbap_prefix(frame)?;

    if tx_id != expected_tx_id {
        debug!(
            "Rejected frame with transaction id {} (expected {}): {}",
            tx_id,
            expected_tx_id,
            hex::encode(frame)
        );
        return Err(AcqSrvError::ProtocolError(format!(
            "Transaction id mismatch: expected {expected_tx_id}, got {tx_id}"
        )));
    }

    let body = &frame[MBAP_PREFIX_LEN..];
    if body.len() < body_len {
        debug!("Rejected truncated frame: {}", hex::encode(frame));
        return Err(AcqSrvError::ProtocolError(format!(
            "Truncated frame: {} of {} body bytes",
            body.len(),
            body_len
        )));
    }

    // body = unit id + PDU
    let pdu_bytes = &body[1..body_len];
    if pdu_bytes.is_empty() {
        return Err(AcqSrvError::ProtocolError("Empty response PDU".to_string()));
    }

    let pdu = ModbusPdu::from_slice(pdu_bytes)?;

    if pdu.is_exception() {
        let fc = pdu.function_code().unwrap_or(0);
        if fc & 0x7F != expected_fc {
            debug!(
                "Rejected exception frame for foreign function code: {}",
                hex::encode(frame)
            );
            return Err(AcqSrvError::ProtocolError(format!(
                "Exception for unexpected function code: {:02X}",
                fc & 0x7F
            )));
        }
        return Err(AcqSrvError::ModbusException(pdu.exception_code().unwrap_or(0)));
    }

    if pdu.function_code() != Some(expected_fc) {
        debug!("Rejected frame with wrong function code: {}", hex::encode(frame));
        return Err(AcqSrvError::ProtocolError(format!(
            "Function code mismatch: expected {:02X}, got {:02X}",
            expected_fc,
            pdu.function_code().unwrap_or(0)
        )));
    }

    Ok(pdu)
}
