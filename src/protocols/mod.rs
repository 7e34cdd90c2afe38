//! Protocol implementations.

pub mod modbus;
