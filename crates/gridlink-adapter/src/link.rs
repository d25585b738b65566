//! ---
//! ems_section: "03-device-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Register-level transport links for SunSpec devices."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Register links.
//!
//! A [`RegisterLink`] is the lowest seam of the adapter: open a connection,
//! read a window of holding registers, close. [`TcpRegisterLink`] speaks
//! Modbus TCP (function 0x03 only, which is all SunSpec needs).

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{AdapterError, Result};

/// Maximum registers per read, per the Modbus application protocol.
pub const MAX_READ_COUNT: u16 = 125;

/// Async register-level transport.
#[async_trait]
pub trait RegisterLink: Send + Sync {
    /// Establish the underlying connection. Idempotent.
    async fn open(&self) -> Result<()>;

    /// Tear down the underlying connection. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Read `count` holding registers starting at `address`.
    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>>;
}

/// Modbus TCP register link.
pub struct TcpRegisterLink {
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
    txn: AtomicU16,
}

impl TcpRegisterLink {
    /// Create a link for one device endpoint. No connection is made yet.
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            timeout,
            stream: Mutex::new(None),
            txn: AtomicU16::new(1),
        }
    }

    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(AdapterError::LinkClosed)?;

        let io = async {
            stream.write_all(request).await?;
            let mut header = [0u8; 7];
            stream.read_exact(&mut header).await?;
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            if length < 2 {
                return Ok(Vec::new());
            }
            // the unit id byte is counted in the MBAP length and already read
            let mut body = vec![0u8; length - 1];
            stream.read_exact(&mut body).await?;
            Ok::<_, std::io::Error>(body)
        };
        let outcome = tokio::time::timeout(self.timeout, io).await;
        match outcome {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(err)) => {
                *guard = None;
                Err(err.into())
            }
            Err(_) => {
                *guard = None;
                Err(AdapterError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl RegisterLink for TcpRegisterLink {
    async fn open(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let address = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| AdapterError::Timeout(self.timeout))??;
        stream.set_nodelay(true)?;
        debug!(endpoint = %address, "register link opened");
        *guard = Some(stream);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        if count == 0 || count > MAX_READ_COUNT {
            return Err(AdapterError::Protocol(format!(
                "read count {count} out of range"
            )));
        }
        let txn = self.txn.fetch_add(1, Ordering::Relaxed);
        let request = encode_read_request(txn, self.unit_id, address, count);
        let body = self.exchange(&request).await?;
        parse_read_response(&body, count)
    }
}

/// Encode a read-holding-registers request with its MBAP header.
fn encode_read_request(txn: u16, unit_id: u8, address: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12);
    frame.extend_from_slice(&txn.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // protocol id
    frame.extend_from_slice(&6u16.to_be_bytes()); // unit + pdu length
    frame.push(unit_id);
    frame.push(0x03);
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    frame
}

/// Parse a read-holding-registers response PDU (function byte onward).
fn parse_read_response(body: &[u8], count: u16) -> Result<Vec<u16>> {
    if body.is_empty() {
        return Err(AdapterError::Protocol("empty response".to_owned()));
    }
    if body[0] == 0x83 {
        let code = body.get(1).copied().unwrap_or(0);
        return Err(AdapterError::Exception(code));
    }
    if body[0] != 0x03 {
        return Err(AdapterError::Protocol(format!(
            "unexpected function 0x{:02x}",
            body[0]
        )));
    }
    let expected = count as usize * 2;
    let byte_count = body.get(1).copied().unwrap_or(0) as usize;
    if byte_count != expected || body.len() < 2 + expected {
        return Err(AdapterError::Protocol(format!(
            "short register payload: want {expected} bytes, got {byte_count}"
        )));
    }
    let registers = body[2..2 + expected]
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(registers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_layout() {
        let frame = encode_read_request(0x0102, 1, 40000, 2);
        assert_eq!(
            frame,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x9C, 0x40, 0x00, 0x02]
        );
    }

    #[test]
    fn response_parses_registers() {
        let body = [0x03, 0x04, 0x53, 0x75, 0x6E, 0x53];
        let regs = parse_read_response(&body, 2).unwrap();
        assert_eq!(regs, vec![0x5375, 0x6E53]);
    }

    #[test]
    fn exception_response_maps_to_error() {
        let err = parse_read_response(&[0x83, 0x02], 2).unwrap_err();
        assert!(matches!(err, AdapterError::Exception(0x02)));
    }

    #[test]
    fn short_payload_is_rejected() {
        let err = parse_read_response(&[0x03, 0x02, 0x00], 2).unwrap_err();
        assert!(matches!(err, AdapterError::Protocol(_)));
    }

    #[test]
    fn count_bounds_are_enforced() {
        let link = TcpRegisterLink::new("localhost", 502, 1, Duration::from_millis(10));
        let err = futures::executor::block_on(link.read_registers(0, 0)).unwrap_err();
        assert!(matches!(err, AdapterError::Protocol(_)));
    }
}
