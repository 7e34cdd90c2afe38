//! Per-device Modbus TCP connection
//!
//! One connection per device, exclusively owned by its worker, with at
//! most one outstanding transaction. Intermediate states are internal;
//! observers only ever see `Connected` and `Disconnected`, which keeps
//! transient connect/close flaps from triggering downstream queue
//! flushes.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{AcqSrvError, Result};
use crate::point::{ReadResult, Request, RequestKind, WriteResult};
use crate::utils::now_ms;

use super::codec::ModbusCodec;
use super::constants::MBAP_PREFIX_LEN;
use super::frame::{self, TransactionId};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    /// Collapse internal states to the externally observable pair.
    pub fn observable(self) -> ConnectionState {
        match self {
            ConnectionState::Connected => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Outcome of a completed transaction.
#[derive(Debug, Clone)]
pub enum ExecResponse {
    Read(ReadResult),
    Write(WriteResult),
}

/// One TCP socket to one Modbus device.
pub struct ModbusConnection {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    state: ConnectionState,
    tx_id: TransactionId,
}

impl std::fmt::Debug for ModbusConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state)
            .finish()
    }
}

impl ModbusConnection {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
            state: ConnectionState::Disconnected,
            tx_id: TransactionId::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.observable()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Connect to the device. Re-entry while connected is a no-op.
    pub async fn connect(&mut self, connect_timeout: Duration) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let addr = format!("{}:{}", self.host, self.port);
        self.state = ConnectionState::Connecting;
        debug!("Connecting to Modbus TCP endpoint: {}", addr);

        match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
                }
                self.stream = Some(stream);
                self.state = ConnectionState::Connected;
                info!("Connected to Modbus TCP endpoint: {}", addr);
                Ok(())
            },
            Ok(Err(e)) => {
                self.state = ConnectionState::Disconnected;
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    Err(AcqSrvError::ConnectionRefused(format!("{addr}: {e}")))
                } else {
                    Err(AcqSrvError::ConnectionError(format!(
                        "Failed to connect to {addr}: {e}"
                    )))
                }
            },
            Err(_) => {
                self.state = ConnectionState::Disconnected;
                Err(AcqSrvError::ConnectTimeout(format!(
                    "Connection to {addr} timed out"
                )))
            },
        }
    }

    /// Close the socket immediately. Used for shutdown and to abandon an
    /// in-flight request on preemption or timeout.
    pub fn force_close(&mut self) {
        if self.stream.is_some() {
            self.state = ConnectionState::Closing;
            self.stream = None;
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Execute one request with a per-request timeout.
    ///
    /// On timeout the socket is closed so the abandoned reply cannot
    /// correlate with a later transaction. Protocol-level failures also
    /// close the socket; a Modbus exception response leaves the
    /// connection up and fails only the request.
    pub async fn execute(&mut self, request: &Request, request_timeout: Duration) -> Result<ExecResponse> {
        if !self.is_connected() {
            return Err(AcqSrvError::NotConnected);
        }

        let pdu = ModbusCodec::build_request_pdu(request)?;
        let expected_fc = request.kind.function_code();
        let tx_id = self.tx_id.next();
        let frame_bytes = frame::encode_request(&pdu, request.unit_id, tx_id);

        let result = timeout(request_timeout, self.transact(&frame_bytes, tx_id, expected_fc)).await;

        match result {
            Ok(Ok(pdu)) => self.build_response(request, &pdu),
            Ok(Err(e)) => {
                match e {
                    // Exception responses are request-local; the device
                    // answered, so the connection stays up.
                    AcqSrvError::ModbusException(_) => {},
                    _ => self.force_close(),
                }
                Err(e)
            },
            Err(_) => {
                self.force_close();
                Err(AcqSrvError::RequestTimeout(format!(
                    "No reply from {}:{} within {:?} (tx {})",
                    self.host, self.port, request_timeout, tx_id
                )))
            },
        }
    }

    /// Send the frame and read exactly one correlated response.
    async fn transact(
        &mut self,
        frame_bytes: &[u8],
        expected_tx_id: u16,
        expected_fc: u8,
    ) -> Result<super::pdu::ModbusPdu> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(AcqSrvError::NotConnected)?;

        stream.write_all(frame_bytes).await?;

        let mut prefix = [0u8; MBAP_PREFIX_LEN];
        stream.read_exact(&mut prefix).await.map_err(map_read_err)?;
        let (_, body_len) = frame::parse_mbap_prefix(&prefix)?;

        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).await.map_err(map_read_err)?;

        let mut full = Vec::with_capacity(MBAP_PREFIX_LEN + body_len);
        full.extend_from_slice(&prefix);
        full.extend_from_slice(&body);

        frame::decode_response(&full, expected_tx_id, expected_fc)
    }

    fn build_response(&self, request: &Request, pdu: &super::pdu::ModbusPdu) -> Result<ExecResponse> {
        let expected_fc = request.kind.function_code();
        let timestamp_ms = now_ms();

        match &request.kind {
            RequestKind::ReadHolding
            | RequestKind::ReadInput
            | RequestKind::ReadCoils
            | RequestKind::ReadDiscrete => {
                let raw = ModbusCodec::parse_read_response(pdu, expected_fc, request.count)?;

                // Decode every aligned slot of the requested type; the
                // router re-decodes block members at their own offsets.
                let mut decoded = BTreeMap::new();
                let mut flags = crate::point::FloatFlags::default();
                let width = usize::from(request.data_type.width());
                let mut offset = 0;
                while offset + width <= raw.len() {
                    if let Ok((value, f)) = ModbusCodec::decode_value(&raw, offset, request.data_type)
                    {
                        flags.merge(f);
                        decoded.insert(
                            (request.start_address + offset as u16).to_string(),
                            value,
                        );
                    }
                    offset += width;
                }

                Ok(ExecResponse::Read(ReadResult {
                    success: true,
                    start_address: request.start_address,
                    count: request.count,
                    data_type: request.data_type,
                    raw,
                    decoded,
                    flags,
                    error: None,
                    timestamp_ms,
                }))
            },
            RequestKind::WriteHolding(_) | RequestKind::WriteCoils(_) => {
                ModbusCodec::parse_write_response(pdu, expected_fc)?;
                Ok(ExecResponse::Write(WriteResult {
                    success: true,
                    start_address: request.start_address,
                    count: request.count,
                    error: None,
                    timestamp_ms,
                }))
            },
        }
    }
}

fn map_read_err(e: std::io::Error) -> AcqSrvError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        AcqSrvError::ConnectionError("Connection closed by peer".to_string())
    } else {
        AcqSrvError::from(e)
    }
}
