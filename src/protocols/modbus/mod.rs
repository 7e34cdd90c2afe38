//! Modbus TCP protocol stack: PDU, codec, MBAP framing and the per-device
//! connection.

pub mod codec;
pub mod connection;
pub mod constants;
pub mod frame;
pub mod pdu;
pub mod simulator;

pub use codec::ModbusCodec;
pub use connection::{ConnectionState, ModbusConnection};
pub use frame::{decode_response, encode_request, TransactionId};
pub use pdu::{ModbusPdu, PduBuilder};
