//! # Servo Serial Transport Layer
//!
//! 半双工串口传输抽象。控制循环只通过 `Transport` trait 读写字节，
//! 不关心底层是真实串口还是测试用的 Mock。

use std::time::{Duration, Instant};
use thiserror::Error;

#[cfg(feature = "serialport")]
pub mod port;

#[cfg(feature = "serialport")]
pub use port::SerialPortTransport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// 传输层统一错误类型
#[derive(Error, Debug)]
pub enum SerialError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Port(#[from] serialport::Error),

    #[error("Read timeout")]
    Timeout,

    #[error("Transport not open")]
    NotOpen,

    #[error("Injected fault: {0}")]
    Injected(String),
}

/// 串口参数
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SerialConfig {
    /// 设备路径，如 `/dev/ttyUSB0` 或 `COM3`
    pub port: String,
    /// 波特率
    pub baud_rate: u32,
    /// 单次读取的默认超时（毫秒）
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::from("/dev/ttyUSB0"),
            baud_rate: 1_000_000,
            read_timeout_ms: 30,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// 字节传输能力
///
/// 只允许控制循环所在线程访问（半双工总线）。
pub trait Transport: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<(), SerialError>;

    fn flush(&mut self) -> Result<(), SerialError>;

    /// 在 `timeout` 内读取至多 `buf.len()` 字节，返回实际读取数
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SerialError>;

    fn clear_errors(&mut self) -> Result<(), SerialError> {
        Ok(())
    }

    /// 丢弃接收缓冲区中尚未读取的字节
    fn clear_read_backlog(&mut self) -> Result<(), SerialError>;

    /// 写入并刷新
    fn send(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        self.write(bytes)?;
        self.flush()
    }

    /// 在截止时间前尽量读满 `buf`，返回实际读取数（可能不足）
    fn read_full(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SerialError> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.read(&mut buf[filled..], remaining) {
                Ok(n) => filled += n,
                Err(SerialError::Timeout) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// 清除错误状态和接收积压，失败只记录日志
    fn recover(&mut self) {
        if let Err(e) = self.clear_errors() {
            tracing::debug!(error = %e, "clear_errors failed");
        }
        if let Err(e) = self.clear_read_backlog() {
            tracing::debug!(error = %e, "clear_read_backlog failed");
        }
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        (**self).write(bytes)
    }

    fn flush(&mut self) -> Result<(), SerialError> {
        (**self).flush()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, SerialError> {
        (**self).read(buf, timeout)
    }

    fn clear_errors(&mut self) -> Result<(), SerialError> {
        (**self).clear_errors()
    }

    fn clear_read_backlog(&mut self) -> Result<(), SerialError> {
        (**self).clear_read_backlog()
    }
}
