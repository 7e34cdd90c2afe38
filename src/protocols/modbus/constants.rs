//! Modbus protocol constants
//!
//! Frame-size constants come from the Modbus specification (the 253-byte
//! PDU limit is inherited from the RS485 ADU limit of 256 bytes). The
//! operation caps are this engine's: reads are limited to 125 entries for
//! register *and* bit operations, the stricter bound observed on the
//! target fleet. The protocol-level 2000-bit read limit is documented
//! here but intentionally not used for validation.

/// MBAP prefix length read before the body: Transaction ID(2) +
/// Protocol ID(2) + Length(2). The Length field counts Unit ID + PDU.
pub const MBAP_PREFIX_LEN: usize = 6;

/// Full MBAP header length including the unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification:
/// RS485 ADU (256) - slave address (1) - CRC (2).
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value: Unit ID (1) + max PDU (253).
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Receive buffer size; the theoretical maximum frame is 260 bytes, the
/// margin avoids short-read errors on coalesced responses.
pub const RESPONSE_BUFFER_SIZE: usize = 512;

/// Maximum entries per read operation, registers and bits alike.
///
/// Register arithmetic: 1 (FC) + 1 (byte count) + N*2 <= 253 gives
/// N <= 125. The Modbus spec would allow 2000 bits per bit read
/// (`MODBUS_SPEC_MAX_READ_BITS`), but the engine enforces 125 everywhere.
pub const MAX_READ_COUNT: usize = 125;

/// Spec-level bit read limit, kept for reference only.
pub const MODBUS_SPEC_MAX_READ_BITS: usize = 2000;

/// Maximum registers per FC16 write:
/// 1 (FC) + 2 (addr) + 2 (qty) + 1 (byte count) + N*2 <= 253 gives N <= 123.
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Maximum coils per FC15 write; capped at the same 125 as reads.
pub const MAX_WRITE_COILS: usize = 125;

/// Modbus TCP protocol identifier (always zero).
pub const PROTOCOL_ID: u16 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_PREFIX_LEN, 6);
        assert_eq!(MBAP_HEADER_LEN, 7);
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(MAX_MBAP_LENGTH, 254);
    }

    #[test]
    fn test_read_cap_fits_pdu() {
        // Response PDU: FC + byte count + data.
        let read_pdu = 1 + 1 + MAX_READ_COUNT * 2;
        assert!(read_pdu <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_write_register_cap_fits_pdu() {
        // Request PDU: FC + addr + qty + byte count + data.
        let write_pdu = 1 + 2 + 2 + 1 + MAX_WRITE_REGISTERS * 2;
        assert!(write_pdu <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_bit_cap_is_stricter_than_spec() {
        assert!(MAX_READ_COUNT < MODBUS_SPEC_MAX_READ_BITS);
        assert!(MAX_WRITE_COILS <= MAX_READ_COUNT);
    }
}
