//! # Servo Protocol
//!
//! 串行总线舵机协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `frame`: 通用帧格式（同步字、长度、校验和）与接收缓冲区扫描
//! - `dynamixel`: 寄存器寻址舵机（Dynamixel RX 系列）的指令、寄存器表和报文
//! - `openservo`: 总线寻址舵机（OpenServo，RS485 + I2C 地址对）的命令和寄存器
//!
//! ## 帧格式
//!
//! 两个舵机族共用同一帧外壳：
//!
//! ```text
//! [0xFF][0xFF][id][len][body ... (len - 1 字节)][checksum]
//! checksum = ~(id + len + sum(body)) & 0xFF
//! ```
//!
//! ## 字节序
//!
//! Dynamixel 的 2 字节寄存器为小端（低字节在前），
//! OpenServo 的寄存器字为大端（高字节在前）。

pub mod dynamixel;
pub mod frame;
pub mod openservo;

pub use frame::{
    FRAME_OVERHEAD, MIN_FRAME_LEN, Packet, PacketCursor, PacketFormat, RawFrame, SYNC, checksum,
    encode_frame, parse_frame,
};

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated frame at offset {offset}: need {needed} bytes, got {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Bad sync bytes at offset {offset}: 0x{first:02X} 0x{second:02X}")]
    BadSync { offset: usize, first: u8, second: u8 },

    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Invalid length byte: {0}")]
    InvalidLength(u8),

    #[error("Frame body too long: {0} bytes")]
    FrameTooLong(usize),

    #[error("Invalid servo id: {0}")]
    InvalidServoId(u8),

    #[error("Invalid bus address: rs485={rs485}, i2c={i2c}")]
    InvalidBusAddress { rs485: u8, i2c: u8 },

    #[error("Invalid register range: {first} .. {last}")]
    InvalidRegisterRange { first: String, last: String },

    #[error("Value {value} does not fit register {register} ({width} bytes)")]
    ValueOutOfRange {
        register: String,
        width: u8,
        value: u16,
    },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: u8 },
}

/// 小端字节序转 u16（Dynamixel 寄存器）
pub fn u16_from_le(lo: u8, hi: u8) -> u16 {
    u16::from_le_bytes([lo, hi])
}

/// 大端字节序转 u16（OpenServo 寄存器字）
pub fn u16_from_be(hi: u8, lo: u8) -> u16 {
    u16::from_be_bytes([hi, lo])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u16_from_le() {
        assert_eq!(u16_from_le(0x34, 0x12), 0x1234);
        assert_eq!(u16_from_le(0xFF, 0x03), 1023);
    }

    #[test]
    fn test_u16_from_be() {
        assert_eq!(u16_from_be(0x12, 0x34), 0x1234);
        assert_eq!(u16_from_be(0x00, 0x01), 1);
    }

    #[test]
    fn test_error_display() {
        let err = ProtocolError::ChecksumMismatch {
            expected: 0xAB,
            actual: 0x01,
        };
        assert_eq!(err.to_string(), "Checksum mismatch: expected 0xAB, got 0x01");
    }
}
