//! Modbus codec
//!
//! Pure conversions between PDUs, raw registers and typed values.
//! Registers are 16-bit big-endian on the wire; multi-register values are
//! laid out big-endian across registers (MSB register first).

use crate::error::{AcqSrvError, Result};
use crate::point::{DataType, FloatFlags, Request, RequestKind, Value};

use super::constants;
use super::pdu::{ModbusPdu, PduBuilder};

/// Modbus codec for request building and data decoding.
pub struct ModbusCodec;

impl ModbusCodec {
    /// Build the request PDU for any supported operation.
    pub fn build_request_pdu(request: &Request) -> Result<ModbusPdu> {
        request.validate()?;
        match &request.kind {
            RequestKind::ReadCoils
            | RequestKind::ReadDiscrete
            | RequestKind::ReadHolding
            | RequestKind::ReadInput => Self::build_read_pdu(
                request.kind.function_code(),
                request.start_address,
                request.count,
            ),
            RequestKind::WriteHolding(values) if values.len() == 1 => {
                Self::build_write_single_register_pdu(request.start_address, values[0])
            },
            RequestKind::WriteHolding(values) => {
                Self::build_write_multiple_registers_pdu(request.start_address, values)
            },
            RequestKind::WriteCoils(values) if values.len() == 1 => {
                Self::build_write_single_coil_pdu(request.start_address, values[0])
            },
            RequestKind::WriteCoils(values) => {
                Self::build_write_multiple_coils_pdu(request.start_address, values)
            },
        }
    }

    /// Build a read PDU (FC 0x01..0x04).
    pub fn build_read_pdu(fc: u8, address: u16, count: u16) -> Result<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(address)?
            .quantity(count)?
            .build())
    }

    /// Build a write PDU for FC05 (Write Single Coil).
    pub fn build_write_single_coil_pdu(address: u16, value: bool) -> Result<ModbusPdu> {
        // FC05 request value is 0xFF00 for ON, 0x0000 for OFF
        Ok(PduBuilder::new()
            .function_code(0x05)?
            .address(address)?
            .byte(if value { 0xFF } else { 0x00 })?
            .byte(0x00)?
            .build())
    }

    /// Build a write PDU for FC06 (Write Single Register).
    pub fn build_write_single_register_pdu(address: u16, value: u16) -> Result<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(0x06)?
            .address(address)?
            .quantity(value)?
            .build())
    }

    /// Build a write PDU for FC15 (Write Multiple Coils).
    pub fn build_write_multiple_coils_pdu(start_address: u16, values: &[bool]) -> Result<ModbusPdu> {
        if values.is_empty() || values.len() > constants::MAX_WRITE_COILS {
            return Err(AcqSrvError::ProtocolError(
                "Invalid coil count for FC15".to_string(),
            ));
        }

        let mut pdu = ModbusPdu::new();
        pdu.push(0x0F)?;
        pdu.push_u16(start_address)?;
        pdu.push_u16(values.len() as u16)?;
        pdu.push(values.len().div_ceil(8) as u8)?;

        // Coil values packed LSB-first
        let mut current_byte = 0u8;
        let mut bit_index = 0;
        for &value in values {
            if value {
                current_byte |= 1 << bit_index;
            }
            bit_index += 1;
            if bit_index == 8 {
                pdu.push(current_byte)?;
                current_byte = 0;
                bit_index = 0;
            }
        }
        if bit_index > 0 {
            pdu.push(current_byte)?;
        }

        Ok(pdu)
    }

    /// Build a write PDU for FC16 (Write Multiple Registers).
    pub fn build_write_multiple_registers_pdu(
        start_address: u16,
        values: &[u16],
    ) -> Result<ModbusPdu> {
        if values.is_empty() || values.len() > constants::MAX_WRITE_REGISTERS {
            return Err(AcqSrvError::ProtocolError(
                "Invalid register count for FC16".to_string(),
            ));
        }

        let mut pdu = ModbusPdu::new();
        pdu.push(0x10)?;
        pdu.push_u16(start_address)?;
        pdu.push_u16(values.len() as u16)?;
        pdu.push((values.len() * 2) as u8)?;
        for &value in values {
            pdu.push_u16(value)?;
        }

        Ok(pdu)
    }

    /// Parse a read response PDU into raw register values.
    ///
    /// Bit reads (FC01/FC02) unpack the LSB-first packed bytes into 0/1
    /// register values so downstream decoding is uniform.
    pub fn parse_read_response(pdu: &ModbusPdu, expected_fc: u8, count: u16) -> Result<Vec<u16>> {
        let data = pdu.as_slice();
        if data.is_empty() {
            return Err(AcqSrvError::ProtocolError("Empty response PDU".to_string()));
        }
        if data[0] != expected_fc {
            return Err(AcqSrvError::ProtocolError(format!(
                "Function code mismatch: expected {:02X}, got {:02X}",
                expected_fc, data[0]
            )));
        }
        if data.len() < 2 {
            return Err(AcqSrvError::ProtocolError(
                "Read response missing byte count".to_string(),
            ));
        }

        let byte_count = usize::from(data[1]);
        let payload = &data[2..];
        if payload.len() < byte_count {
            return Err(AcqSrvError::ProtocolError(format!(
                "Truncated read response: {} of {} payload bytes",
                payload.len(),
                byte_count
            )));
        }
        let payload = &payload[..byte_count];

        match expected_fc {
            0x01 | 0x02 => {
                let expected_bytes = usize::from(count).div_ceil(8);
                if byte_count < expected_bytes {
                    return Err(AcqSrvError::ProtocolError(format!(
                        "Bit response too short: {byte_count} bytes for {count} bits"
                    )));
                }
                let mut values = Vec::with_capacity(usize::from(count));
                for i in 0..usize::from(count) {
                    let byte = payload[i / 8];
                    values.push(u16::from((byte >> (i % 8)) & 1));
                }
                Ok(values)
            },
            0x03 | 0x04 => {
                let expected_bytes = usize::from(count) * 2;
                if byte_count < expected_bytes {
                    return Err(AcqSrvError::ProtocolError(format!(
                        "Register response too short: {byte_count} bytes for {count} registers"
                    )));
                }
                let mut values = Vec::with_capacity(usize::from(count));
                for chunk in payload[..expected_bytes].chunks_exact(2) {
                    values.push(u16::from_be_bytes([chunk[0], chunk[1]]));
                }
                Ok(values)
            },
            other => Err(AcqSrvError::ProtocolError(format!(
                "Unsupported read function code: {other:02X}"
            ))),
        }
    }

    /// Parse a write response PDU; a matching echo indicates success.
    pub fn parse_write_response(pdu: &ModbusPdu, expected_fc: u8) -> Result<()> {
        let data = pdu.as_slice();
        if data.is_empty() {
            return Err(AcqSrvError::ProtocolError("Empty response PDU".to_string()));
        }
        if data[0] != expected_fc {
            return Err(AcqSrvError::ProtocolError(format!(
                "Function code mismatch: expected {:02X}, got {:02X}",
                expected_fc, data[0]
            )));
        }
        // FC05/06/0F/10 all echo address + value/quantity (4 bytes).
        if data.len() < 5 {
            return Err(AcqSrvError::ProtocolError(
                "Truncated write response".to_string(),
            ));
        }
        Ok(())
    }

    /// Decode a typed value at a register offset within a raw buffer.
    ///
    /// Returns the value together with its float classification flags.
    pub fn decode_value(raw: &[u16], offset: usize, data_type: DataType) -> Result<(Value, FloatFlags)> {
        let need = usize::from(data_type.width());
        if raw.len() < offset + need {
            return Err(AcqSrvError::data_conversion(format!(
                "insufficient registers: need {} at offset {offset}, have {}",
                need,
                raw.len()
            )));
        }

        let mut flags = FloatFlags::default();
        let value = match data_type {
            DataType::Reg16 | DataType::InputReg16 => Value::U16(raw[offset]),
            DataType::Coil | DataType::DiscreteInput => Value::Bool(raw[offset] != 0),
            DataType::Bool => Value::Bool(raw[offset] != 0),
            DataType::Float32 => {
                let bits = (u32::from(raw[offset]) << 16) | u32::from(raw[offset + 1]);
                let v = f32::from_bits(bits);
                flags = Self::classify_f32(v);
                Value::F32(v)
            },
            DataType::Int32 => {
                let bits = (u32::from(raw[offset]) << 16) | u32::from(raw[offset + 1]);
                Value::I32(bits as i32)
            },
            DataType::Double64 => {
                let bits = (u64::from(raw[offset]) << 48)
                    | (u64::from(raw[offset + 1]) << 32)
                    | (u64::from(raw[offset + 2]) << 16)
                    | u64::from(raw[offset + 3]);
                let v = f64::from_bits(bits);
                flags = Self::classify_f64(v);
                Value::F64(v)
            },
            DataType::Int64 => {
                let bits = (u64::from(raw[offset]) << 48)
                    | (u64::from(raw[offset + 1]) << 32)
                    | (u64::from(raw[offset + 2]) << 16)
                    | u64::from(raw[offset + 3]);
                Value::I64(bits as i64)
            },
        };
        Ok((value, flags))
    }

    /// Encode a typed value into registers for a write operation.
    pub fn encode_value(value: &Value, data_type: DataType) -> Result<Vec<u16>> {
        match data_type {
            DataType::Reg16 | DataType::InputReg16 => {
                let v = match value {
                    Value::U16(v) => *v,
                    Value::I32(v) => *v as u16,
                    Value::I64(v) => *v as u16,
                    Value::F32(v) => v.round() as u16,
                    Value::F64(v) => v.round() as u16,
                    Value::Bool(v) => u16::from(*v),
                };
                Ok(vec![v])
            },
            DataType::Coil | DataType::DiscreteInput | DataType::Bool => {
                Ok(vec![u16::from(value.truthy())])
            },
            DataType::Float32 => {
                let bits = (value.as_f64() as f32).to_bits();
                Ok(vec![(bits >> 16) as u16, bits as u16])
            },
            DataType::Int32 => {
                let v = match value {
                    Value::I32(v) => *v,
                    Value::I64(v) => *v as i32,
                    Value::U16(v) => i32::from(*v),
                    Value::F32(v) => v.round() as i32,
                    Value::F64(v) => v.round() as i32,
                    Value::Bool(v) => i32::from(*v),
                };
                let bits = v as u32;
                Ok(vec![(bits >> 16) as u16, bits as u16])
            },
            DataType::Double64 => {
                let bits = value.as_f64().to_bits();
                Ok(vec![
                    (bits >> 48) as u16,
                    (bits >> 32) as u16,
                    (bits >> 16) as u16,
                    bits as u16,
                ])
            },
            DataType::Int64 => {
                let v = match value {
                    Value::I64(v) => *v,
                    Value::I32(v) => i64::from(*v),
                    Value::U16(v) => i64::from(*v),
                    Value::F32(v) => v.round() as i64,
                    Value::F64(v) => v.round() as i64,
                    Value::Bool(v) => i64::from(*v),
                };
                let bits = v as u64;
                Ok(vec![
                    (bits >> 48) as u16,
                    (bits >> 32) as u16,
                    (bits >> 16) as u16,
                    bits as u16,
                ])
            },
        }
    }

    /// Classify a decoded f32 for the result flags.
    pub fn classify_f32(v: f32) -> FloatFlags {
        FloatFlags {
            has_nan: v.is_nan(),
            has_inf: v.is_infinite(),
            has_denormal: v.classify() == std::num::FpCategory::Subnormal,
        }
    }

    /// Classify a decoded f64 for the result flags.
    pub fn classify_f64(v: f64) -> FloatFlags {
        FloatFlags {
            has_nan: v.is_nan(),
            has_inf: v.is_infinite(),
            has_denormal: v.classify() == std::num::FpCategory::Subnormal,
        }
    }
}
