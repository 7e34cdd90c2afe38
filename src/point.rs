//! Core data model: points, data types, values, requests and results
//!
//! A [`Point`] is the unit of acquisition. The block planner rewrites sets
//! of points into synthetic block points whose metadata travels in the
//! point's tag map, so downstream stages need no side tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AcqSrvError, Result};

/// Tag keys used for block-point metadata and sample enrichment.
pub mod tag_keys {
    pub const BLOCK_TYPE: &str = "block_type";
    pub const BLOCK_START: &str = "block_start";
    pub const BLOCK_SIZE: &str = "block_size";
    pub const REGISTER_CATEGORY: &str = "register_category";
    pub const ORIGINAL_ADDRESSES: &str = "original_addresses";
    pub const ORIGINAL_NAMES: &str = "original_names";
    pub const ORIGINAL_DATA_TYPES: &str = "original_data_types";
    pub const ORIGINAL_MEASUREMENTS: &str = "original_measurements";
    pub const ORIGINAL_DESCRIPTIONS: &str = "original_descriptions";
    pub const DEVICE_NAME: &str = "device_name";
    pub const DESCRIPTION: &str = "description";
    pub const ADDRESS: &str = "address";
    pub const READ_MODE: &str = "read_mode";
    pub const DATA_TYPE: &str = "data_type";

    /// Marker value stored under [`BLOCK_TYPE`] for planner-generated points.
    pub const BLOCK_TYPE_OPTIMIZED: &str = "optimized_read";
}

/// Data type of an acquisition point.
///
/// The width is the number of 16-bit registers the value occupies on the
/// wire; multi-register values are laid out big-endian, MSB register first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// 16-bit holding register
    Reg16,
    /// 16-bit input register
    InputReg16,
    /// Single coil
    Coil,
    /// Single discrete input
    DiscreteInput,
    /// IEEE-754 single precision across two holding registers
    Float32,
    /// IEEE-754 double precision across four holding registers
    Double64,
    /// Signed 32-bit integer across two holding registers
    Int32,
    /// Signed 64-bit integer across four holding registers
    Int64,
    /// Boolean read from a discrete input
    Bool,
}

impl DataType {
    /// Width in 16-bit registers (bit types count as one).
    pub fn width(&self) -> u16 {
        match self {
            DataType::Reg16 | DataType::InputReg16 | DataType::Coil => 1,
            DataType::DiscreteInput | DataType::Bool => 1,
            DataType::Float32 | DataType::Int32 => 2,
            DataType::Double64 | DataType::Int64 => 4,
        }
    }

    /// Register category, determining which function code reads the point
    /// and which points may share a block.
    pub fn register_category(&self) -> RegisterCategory {
        match self {
            DataType::Reg16
            | DataType::Float32
            | DataType::Double64
            | DataType::Int32
            | DataType::Int64 => RegisterCategory::Holding,
            DataType::InputReg16 => RegisterCategory::Input,
            DataType::Coil => RegisterCategory::Coil,
            DataType::DiscreteInput | DataType::Bool => RegisterCategory::Discrete,
        }
    }

    /// The `read_mode` tag value attached to emitted samples.
    pub fn read_mode(&self) -> &'static str {
        match self {
            DataType::Coil | DataType::DiscreteInput | DataType::Bool => "single_bit",
            DataType::Float32 | DataType::Int32 => "dual_register",
            DataType::Double64 | DataType::Int64 => "quad_register",
            DataType::Reg16 | DataType::InputReg16 => "single_register",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Reg16 => "reg16",
            DataType::InputReg16 => "input_reg16",
            DataType::Coil => "coil",
            DataType::DiscreteInput => "discrete_input",
            DataType::Float32 => "float32",
            DataType::Double64 => "double64",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Bool => "bool",
        }
    }

    /// Parse the `as_str` form back; used when recovering original data
    /// types from block metadata tags.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "reg16" => Ok(DataType::Reg16),
            "input_reg16" => Ok(DataType::InputReg16),
            "coil" => Ok(DataType::Coil),
            "discrete_input" => Ok(DataType::DiscreteInput),
            "float32" => Ok(DataType::Float32),
            "double64" => Ok(DataType::Double64),
            "int32" => Ok(DataType::Int32),
            "int64" => Ok(DataType::Int64),
            "bool" => Ok(DataType::Bool),
            other => Err(AcqSrvError::invalid_data(format!(
                "unknown data type: {other}"
            ))),
        }
    }
}

/// The four Modbus object categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterCategory {
    Holding,
    Input,
    Coil,
    Discrete,
}

impl RegisterCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterCategory::Holding => "holding",
            RegisterCategory::Input => "input",
            RegisterCategory::Coil => "coil",
            RegisterCategory::Discrete => "discrete",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "holding" => Ok(RegisterCategory::Holding),
            "input" => Ok(RegisterCategory::Input),
            "coil" => Ok(RegisterCategory::Coil),
            "discrete" => Ok(RegisterCategory::Discrete),
            other => Err(AcqSrvError::invalid_data(format!(
                "unknown register category: {other}"
            ))),
        }
    }

    /// Function code used to read this category.
    pub fn read_function_code(&self) -> u8 {
        match self {
            RegisterCategory::Coil => 0x01,
            RegisterCategory::Discrete => 0x02,
            RegisterCategory::Holding => 0x03,
            RegisterCategory::Input => 0x04,
        }
    }

    /// Whether this category addresses single bits rather than registers.
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterCategory::Coil | RegisterCategory::Discrete)
    }
}

/// Decoded point value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    U16(u16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
}

impl Value {
    /// Numeric view of the value; booleans map to 0.0/1.0.
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::U16(v) => f64::from(*v),
            Value::I32(v) => f64::from(*v),
            Value::I64(v) => *v as f64,
            Value::F32(v) => f64::from(*v),
            Value::F64(v) => *v,
            Value::Bool(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            },
        }
    }

    /// Numeric-to-bool conversion: NaN is `false`, infinities take the
    /// sign of the value, anything else non-zero is `true`.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(v) => *v,
            Value::U16(v) => *v != 0,
            Value::I32(v) => *v != 0,
            Value::I64(v) => *v != 0,
            Value::F32(v) => float_truthy(f64::from(*v)),
            Value::F64(v) => float_truthy(*v),
        }
    }
}

fn float_truthy(v: f64) -> bool {
    if v.is_nan() {
        false
    } else if v.is_infinite() {
        v.is_sign_positive()
    } else {
        v != 0.0
    }
}

/// Diagnostic flags attached to every read result containing floats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatFlags {
    pub has_nan: bool,
    pub has_inf: bool,
    pub has_denormal: bool,
}

impl FloatFlags {
    pub fn merge(&mut self, other: FloatFlags) {
        self.has_nan |= other.has_nan;
        self.has_inf |= other.has_inf;
        self.has_denormal |= other.has_denormal;
    }
}

/// A configured acquisition point. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    pub address: u16,
    pub data_type: DataType,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    pub measurement: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_unit_id() -> u8 {
    1
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_enabled() -> bool {
    true
}

impl Point {
    /// Device identity: `"{host}:{port}:{unit_id}"`.
    pub fn device_key(&self) -> String {
        format!("{}:{}:{}", self.host, self.port, self.unit_id)
    }

    /// Name used when labeling planner blocks; falls back to `host_port`.
    pub fn device_name(&self) -> String {
        self.tags
            .get(tag_keys::DEVICE_NAME)
            .cloned()
            .unwrap_or_else(|| format!("{}_{}", self.host, self.port))
    }

    /// Validate address range and poll interval.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(AcqSrvError::InvalidParameter("point name is empty".into()));
        }
        if self.poll_interval_ms < 1 {
            return Err(AcqSrvError::InvalidParameter(format!(
                "point '{}': poll interval must be >= 1 ms",
                self.name
            )));
        }
        let end = u32::from(self.address) + u32::from(self.width());
        if end > 65536 {
            return Err(AcqSrvError::InvalidParameter(format!(
                "point '{}': address {} with width {} exceeds register space",
                self.name,
                self.address,
                self.width()
            )));
        }
        Ok(())
    }

    /// Registers to read for this point (block size for block points).
    pub fn width(&self) -> u16 {
        self.block_size().unwrap_or_else(|| self.data_type.width())
    }

    /// Whether this point is a planner-generated block point.
    pub fn is_block(&self) -> bool {
        self.tags
            .get(tag_keys::BLOCK_TYPE)
            .is_some_and(|v| v == tag_keys::BLOCK_TYPE_OPTIMIZED)
    }

    pub fn block_start(&self) -> Option<u16> {
        self.tags.get(tag_keys::BLOCK_START)?.parse().ok()
    }

    pub fn block_size(&self) -> Option<u16> {
        if !self.is_block() {
            return None;
        }
        self.tags.get(tag_keys::BLOCK_SIZE)?.parse().ok()
    }

    /// Recover the original per-point metadata from a block point's tags.
    pub fn original_points(&self) -> Result<Vec<OriginalPoint>> {
        let split = |key: &str| -> Vec<String> {
            self.tags
                .get(key)
                .map(|v| v.split(',').map(str::to_string).collect())
                .unwrap_or_default()
        };

        let addresses = split(tag_keys::ORIGINAL_ADDRESSES);
        let names = split(tag_keys::ORIGINAL_NAMES);
        let data_types = split(tag_keys::ORIGINAL_DATA_TYPES);
        let measurements = split(tag_keys::ORIGINAL_MEASUREMENTS);
        let descriptions = split(tag_keys::ORIGINAL_DESCRIPTIONS);

        if addresses.len() != names.len() || addresses.len() != data_types.len() {
            return Err(AcqSrvError::invalid_data(format!(
                "block point '{}': inconsistent original metadata",
                self.name
            )));
        }

        let mut originals = Vec::with_capacity(addresses.len());
        for (i, addr) in addresses.iter().enumerate() {
            let address: u16 = addr.parse().map_err(|_| {
                AcqSrvError::invalid_data(format!(
                    "block point '{}': bad original address '{addr}'",
                    self.name
                ))
            })?;
            originals.push(OriginalPoint {
                address,
                name: names[i].clone(),
                data_type: DataType::parse(&data_types[i])?,
                measurement: measurements.get(i).cloned().unwrap_or_default(),
                description: descriptions.get(i).cloned().unwrap_or_default(),
            });
        }
        Ok(originals)
    }
}

/// Metadata of one original point covered by a block point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalPoint {
    pub address: u16,
    pub name: String,
    pub data_type: DataType,
    pub measurement: String,
    pub description: String,
}

/// Request priority, totally ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// The operation a request performs.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    ReadHolding,
    ReadInput,
    ReadCoils,
    ReadDiscrete,
    WriteHolding(Vec<u16>),
    WriteCoils(Vec<bool>),
}

impl RequestKind {
    pub fn function_code(&self) -> u8 {
        match self {
            RequestKind::ReadCoils => 0x01,
            RequestKind::ReadDiscrete => 0x02,
            RequestKind::ReadHolding => 0x03,
            RequestKind::ReadInput => 0x04,
            RequestKind::WriteHolding(values) if values.len() == 1 => 0x06,
            RequestKind::WriteHolding(_) => 0x10,
            RequestKind::WriteCoils(values) if values.len() == 1 => 0x05,
            RequestKind::WriteCoils(_) => 0x0F,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, RequestKind::WriteHolding(_) | RequestKind::WriteCoils(_))
    }
}

/// One Modbus request against a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: RequestKind,
    pub start_address: u16,
    pub count: u16,
    pub unit_id: u8,
    pub data_type: DataType,
}

impl Request {
    /// Build a read request for a point (block-aware).
    pub fn read_for_point(point: &Point) -> Self {
        let kind = match point.data_type.register_category() {
            RegisterCategory::Holding => RequestKind::ReadHolding,
            RegisterCategory::Input => RequestKind::ReadInput,
            RegisterCategory::Coil => RequestKind::ReadCoils,
            RegisterCategory::Discrete => RequestKind::ReadDiscrete,
        };
        Request {
            kind,
            start_address: point.block_start().unwrap_or(point.address),
            count: point.width(),
            unit_id: point.unit_id,
            data_type: point.data_type,
        }
    }

    /// Validate request bounds before any frame is built.
    ///
    /// Read counts are capped at 125 for register and bit operations
    /// alike; multi-register writes are capped at 123 by PDU arithmetic.
    pub fn validate(&self) -> Result<()> {
        use crate::protocols::modbus::constants::{
            MAX_READ_COUNT, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
        };

        let max = match &self.kind {
            RequestKind::ReadHolding
            | RequestKind::ReadInput
            | RequestKind::ReadCoils
            | RequestKind::ReadDiscrete => MAX_READ_COUNT,
            RequestKind::WriteHolding(_) => MAX_WRITE_REGISTERS,
            RequestKind::WriteCoils(_) => MAX_WRITE_COILS,
        };

        if self.count == 0 || usize::from(self.count) > max {
            return Err(AcqSrvError::InvalidParameter(format!(
                "request count {} out of range 1..={max}",
                self.count
            )));
        }

        if let RequestKind::WriteHolding(values) = &self.kind {
            if values.len() != usize::from(self.count) {
                return Err(AcqSrvError::InvalidParameter(
                    "write payload length does not match count".into(),
                ));
            }
        }
        if let RequestKind::WriteCoils(values) = &self.kind {
            if values.len() != usize::from(self.count) {
                return Err(AcqSrvError::InvalidParameter(
                    "write payload length does not match count".into(),
                ));
            }
        }

        let end = u32::from(self.start_address) + u32::from(self.count);
        if end > 65536 {
            return Err(AcqSrvError::InvalidParameter(format!(
                "request [{}..{end}) exceeds register space",
                self.start_address
            )));
        }
        Ok(())
    }
}

/// A request waiting in (or executing from) a worker's priority queue.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request: Request,
    pub priority: RequestPriority,
    pub request_id: u64,
    pub enqueue_time_ms: i64,
    pub interruptible: bool,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    /// Higher priority first; within a priority, FIFO by enqueue time,
    /// with the request id as the final tie-break for same-millisecond
    /// submissions.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueue_time_ms.cmp(&self.enqueue_time_ms))
            .then_with(|| other.request_id.cmp(&self.request_id))
    }
}

/// Result of a read transaction.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub success: bool,
    pub start_address: u16,
    pub count: u16,
    pub data_type: DataType,
    /// Raw register values; bit reads store 0/1 per address.
    pub raw: Vec<u16>,
    /// Decoded values keyed by register address.
    pub decoded: BTreeMap<String, Value>,
    pub flags: FloatFlags,
    pub error: Option<String>,
    pub timestamp_ms: i64,
}

impl ReadResult {
    pub fn failed(request: &Request, error: String, timestamp_ms: i64) -> Self {
        ReadResult {
            success: false,
            start_address: request.start_address,
            count: request.count,
            data_type: request.data_type,
            raw: Vec::new(),
            decoded: BTreeMap::new(),
            flags: FloatFlags::default(),
            error: Some(error),
            timestamp_ms,
        }
    }
}

/// Result of a write transaction.
#[derive(Debug, Clone)]
pub struct WriteResult {
    pub success: bool,
    pub start_address: u16,
    pub count: u16,
    pub error: Option<String>,
    pub timestamp_ms: i64,
}

/// A decoded sample ready for the telemetry sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub point_name: String,
    pub value: Value,
    pub timestamp_ms: i64,
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub valid: bool,
    pub error: Option<String>,
}
