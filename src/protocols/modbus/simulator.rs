//! Scripted Modbus TCP device for tests
//!
//! Binds an ephemeral port and answers read/write requests from a
//! mutable behavior script. Fault injection covers the failure modes the
//! engine must survive: stalls, corrupted transaction ids and exception
//! responses.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::constants::MBAP_PREFIX_LEN;

/// What the simulated device should do with incoming requests.
#[derive(Debug, Clone, Default)]
pub struct SimulatorBehavior {
    /// Holding register segments: (start address, values).
    pub holding_registers: Vec<(u16, Vec<u16>)>,
    /// Input register segments.
    pub input_registers: Vec<(u16, Vec<u16>)>,
    /// Coil segments.
    pub coils: Vec<(u16, Vec<bool>)>,
    /// Discrete input segments.
    pub discrete_inputs: Vec<(u16, Vec<bool>)>,
    /// Accept requests but never answer.
    pub stall: bool,
    /// Reply with a shifted transaction id.
    pub corrupt_tx_id: bool,
    /// Reply with this exception code to every request.
    pub exception_code: Option<u8>,
}

/// One request observed by the simulator, for ordering assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedRequest {
    pub function_code: u8,
    pub address: u16,
    pub count: u16,
}

/// An in-process Modbus TCP device.
pub struct SimulatedDevice {
    port: u16,
    behavior: Arc<Mutex<SimulatorBehavior>>,
    observed: Arc<Mutex<Vec<ObservedRequest>>>,
    shutdown: CancellationToken,
}

impl SimulatedDevice {
    /// Bind `127.0.0.1:0` and start serving.
    pub async fn start(behavior: SimulatorBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind simulator listener");
        let port = listener.local_addr().expect("local addr").port();

        let behavior = Arc::new(Mutex::new(behavior));
        let observed = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let accept_behavior = Arc::clone(&behavior);
        let accept_observed = Arc::clone(&observed);
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { break };
                        debug!("Simulator accepted connection from {}", peer);
                        let behavior = Arc::clone(&accept_behavior);
                        let observed = Arc::clone(&accept_observed);
                        let conn_shutdown = accept_shutdown.clone();
                        tokio::spawn(async move {
                            let _ = serve_connection(stream, behavior, observed, conn_shutdown).await;
                        });
                    }
                }
            }
        });

        Self {
            port,
            behavior,
            observed,
            shutdown,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Replace the behavior script; applies to subsequent requests.
    pub fn set_behavior(&self, behavior: SimulatorBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Requests seen so far, in arrival order.
    pub fn observed_requests(&self) -> Vec<ObservedRequest> {
        self.observed.lock().clone()
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    behavior: Arc<Mutex<SimulatorBehavior>>,
    observed: Arc<Mutex<Vec<ObservedRequest>>>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let mut prefix = [0u8; MBAP_PREFIX_LEN];
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            read = stream.read_exact(&mut prefix) => { read?; }
        }

        let tx_id = u16::from_be_bytes([prefix[0], prefix[1]]);
        let body_len = usize::from(u16::from_be_bytes([prefix[4], prefix[5]]));

        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).await?;
        if body.len() < 2 {
            continue;
        }

        let unit_id = body[0];
        let pdu = &body[1..];
        let fc = pdu[0];

        let (address, count) = if pdu.len() >= 5 {
            (
                u16::from_be_bytes([pdu[1], pdu[2]]),
                u16::from_be_bytes([pdu[3], pdu[4]]),
            )
        } else {
            (0, 0)
        };

        observed.lock().push(ObservedRequest {
            function_code: fc,
            address,
            count,
        });

        let script = behavior.lock().clone();

        if script.stall {
            // Hold the request open until the peer gives up.
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = wait_for_close(&mut stream) => return Ok(()),
            }
        }

        let reply_tx = if script.corrupt_tx_id {
            tx_id.wrapping_add(1)
        } else {
            tx_id
        };

        let response_pdu = if let Some(code) = script.exception_code {
            vec![fc | 0x80, code]
        } else {
            build_response_pdu(&script, fc, address, count, pdu)
        };

        let mut frame = Vec::with_capacity(MBAP_PREFIX_LEN + 1 + response_pdu.len());
        frame.extend_from_slice(&reply_tx.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&((1 + response_pdu.len()) as u16).to_be_bytes());
        frame.push(unit_id);
        frame.extend_from_slice(&response_pdu);

        stream.write_all(&frame).await?;
    }
}

/// Wait until the peer closes the socket without consuming valid data.
async fn wait_for_close(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut sink = [0u8; 64];
    loop {
        if stream.read(&mut sink).await? == 0 {
            return Ok(());
        }
    }
}

fn build_response_pdu(
    script: &SimulatorBehavior,
    fc: u8,
    address: u16,
    count: u16,
    request_pdu: &[u8],
) -> Vec<u8> {
    match fc {
        0x01 | 0x02 => {
            let segments = if fc == 0x01 {
                &script.coils
            } else {
                &script.discrete_inputs
            };
            let bits: Vec<bool> = (0..count)
                .map(|i| lookup_bit(segments, address + i))
                .collect();
            let byte_count = bits.len().div_ceil(8);
            let mut pdu = vec![fc, byte_count as u8];
            let mut packed = vec![0u8; byte_count];
            for (i, bit) in bits.iter().enumerate() {
                if *bit {
                    packed[i / 8] |= 1 << (i % 8);
                }
            }
            pdu.extend_from_slice(&packed);
            pdu
        },
        0x03 | 0x04 => {
            let segments = if fc == 0x03 {
                &script.holding_registers
            } else {
                &script.input_registers
            };
            let mut pdu = vec![fc, (count * 2) as u8];
            for i in 0..count {
                let value = lookup_register(segments, address + i);
                pdu.extend_from_slice(&value.to_be_bytes());
            }
            pdu
        },
        // Write responses echo address + value/quantity.
        0x05 | 0x06 | 0x0F | 0x10 => {
            let mut pdu = vec![fc];
            pdu.extend_from_slice(&request_pdu[1..5.min(request_pdu.len())]);
            while pdu.len() < 5 {
                pdu.push(0);
            }
            pdu
        },
        other => vec![other | 0x80, 0x01],
    }
}

fn lookup_register(segments: &[(u16, Vec<u16>)], address: u16) -> u16 {
    for (start, values) in segments {
        if address >= *start && usize::from(address - *start) < values.len() {
            return values[usize::from(address - *start)];
        }
    }
    0
}

fn lookup_bit(segments: &[(u16, Vec<bool>)], address: u16) -> bool {
    for (start, values) in segments {
        if address >= *start && usize::from(address - *start) < values.len() {
            return values[usize::from(address - *start)];
        }
    }
    false
}
