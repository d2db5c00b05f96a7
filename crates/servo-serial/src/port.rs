//! 基于 `serialport` crate 的串口后端

use crate::{SerialConfig, SerialError, Transport};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::{debug, info, trace};

/// 真实串口传输（8N1，无流控）
pub struct SerialPortTransport {
    port: Box<dyn SerialPort>,
    name: String,
    timeout: Duration,
}

impl SerialPortTransport {
    pub fn open(config: &SerialConfig) -> Result<Self, SerialError> {
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(config.read_timeout())
            .open()?;
        info!(port = %config.port, baud_rate = config.baud_rate, "Serial port opened");
        Ok(Self {
            port,
            name: config.port.clone(),
            timeout: config.read_timeout(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transport for SerialPortTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        trace!(port = %self.name, len = bytes.len(), "write");
        self.port.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SerialError> {
        self.port.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SerialError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if timeout != self.timeout {
            self.port.set_timeout(timeout)?;
            self.timeout = timeout;
        }
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(SerialError::Timeout),
            Err(e) => Err(SerialError::Io(e)),
        }
    }

    fn clear_errors(&mut self) -> Result<(), SerialError> {
        self.port.clear_break()?;
        Ok(())
    }

    fn clear_read_backlog(&mut self) -> Result<(), SerialError> {
        let pending = self.port.bytes_to_read().unwrap_or(0);
        if pending > 0 {
            debug!(port = %self.name, pending, "Discarding read backlog");
        }
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
