//! 总线寻址舵机（OpenServo）
//!
//! 舵机通过 RS485 地址 + I2C 地址对寻址。请求帧在通用帧外壳内
//! 携带一个 I2C 事务描述：
//!
//! ```text
//! 读:  FF FF rs485 06 02 readLen (i2c<<1) reg ((i2c<<1)|1) chk
//! 写:  FF FF rs485 (5+n) (2+n) 00 (i2c<<1) reg data[n].. chk
//! 命令: FF FF rs485 (4+n) (1+n) 00 (i2c<<1) cmd[n].. chk
//! ```
//!
//! 寄存器字为大端字节序（高字节在前）。

use crate::frame::encode_frame;
use crate::{ProtocolError, u16_from_be};
use std::fmt;

/// RS485 地址上限（不含）
pub const MAX_RS485_ADDRESS: u8 = 254;
/// I2C 地址上限（不含）
pub const MAX_I2C_ADDRESS: u8 = 127;

/// 舵机地址对
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OpenServoId {
    rs485: u8,
    i2c: u8,
}

impl OpenServoId {
    pub fn new(rs485: u8, i2c: u8) -> Result<Self, ProtocolError> {
        if rs485 >= MAX_RS485_ADDRESS || i2c >= MAX_I2C_ADDRESS {
            return Err(ProtocolError::InvalidBusAddress { rs485, i2c });
        }
        Ok(Self { rs485, i2c })
    }

    pub fn rs485(self) -> u8 {
        self.rs485
    }

    pub fn i2c(self) -> u8 {
        self.i2c
    }

    fn i2c_write(self) -> u8 {
        self.i2c << 1
    }

    fn i2c_read(self) -> u8 {
        (self.i2c << 1) | 1
    }
}

impl fmt::Display for OpenServoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.rs485, self.i2c)
    }
}

/// 命令字节
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u8)]
pub enum Command {
    Reset = 0x80,
    CheckedTxn = 0x81,
    PwmEnable = 0x82,
    PwmDisable = 0x83,
    WriteEnable = 0x84,
    WriteDisable = 0x85,
    RegistersSave = 0x86,
    RegistersRestore = 0x87,
    RegistersDefault = 0x88,
    EepromErase = 0x89,
    VoltageRead = 0x90,
    CurveMotionEnable = 0x91,
    CurveMotionDisable = 0x92,
    CurveMotionReset = 0x93,
    CurveMotionAppend = 0x94,
}

/// 寄存器地址
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    num_enum::TryFromPrimitive,
    num_enum::IntoPrimitive,
)]
#[repr(u8)]
pub enum Register {
    PositionHi = 0x08,
    PositionLo = 0x09,
    VelocityHi = 0x0A,
    VelocityLo = 0x0B,
    PowerHi = 0x0C,
    PowerLo = 0x0D,
    PwmCw = 0x0E,
    PwmCcw = 0x0F,
    SeekHi = 0x10,
    SeekLo = 0x11,
    SeekVelocityHi = 0x12,
    SeekVelocityLo = 0x13,
    VoltageHi = 0x14,
    VoltageLo = 0x15,
    PidDeadband = 0x21,
    PidPgainHi = 0x22,
    PidPgainLo = 0x23,
    PidDgainHi = 0x24,
    PidDgainLo = 0x25,
    PidIgainHi = 0x26,
    PidIgainLo = 0x27,
    Reverse = 48,
    PulseControlEnabled = 51,
}

impl Register {
    pub fn address(self) -> u8 {
        self.into()
    }
}

/// 反馈读取的起始寄存器
pub const FEEDBACK_FIRST: Register = Register::PositionHi;
/// 反馈读取的结束寄存器（含）
pub const FEEDBACK_LAST: Register = Register::VoltageLo;
/// 反馈读取字节数：7 个大端字
pub const FEEDBACK_LEN: u8 = Register::VoltageLo as u8 - Register::PositionHi as u8 + 1;

/// 发送一组命令字节（不期望响应）
pub fn send_commands(id: OpenServoId, commands: &[Command]) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Vec::with_capacity(commands.len() + 3);
    body.push((1 + commands.len()) as u8);
    body.push(0);
    body.push(id.i2c_write());
    body.extend(commands.iter().map(|c| u8::from(*c)));
    encode_frame(id.rs485, &body)
}

/// 从 `first` 开始写入原始字节
pub fn write_registers(
    id: OpenServoId,
    first: Register,
    data: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Vec::with_capacity(data.len() + 4);
    body.push((2 + data.len()) as u8);
    body.push(0);
    body.push(id.i2c_write());
    body.push(first.address());
    body.extend_from_slice(data);
    encode_frame(id.rs485, &body)
}

/// 从 `first` 开始写入大端字
pub fn write_words(
    id: OpenServoId,
    first: Register,
    words: &[u16],
) -> Result<Vec<u8>, ProtocolError> {
    let data: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    write_registers(id, first, &data)
}

/// 读 `read_len` 字节，响应为 `read_len + 5` 字节的帧
pub fn read_registers(id: OpenServoId, first: Register, read_len: u8) -> Vec<u8> {
    let body = [
        2,
        read_len,
        id.i2c_write(),
        first.address(),
        id.i2c_read(),
    ];
    let mut frame = Vec::with_capacity(body.len() + crate::FRAME_OVERHEAD);
    frame.extend_from_slice(&crate::SYNC);
    frame.push(id.rs485);
    frame.push(body.len() as u8 + 1);
    frame.extend_from_slice(&body);
    frame.push(crate::checksum(&frame[2..]));
    frame
}

/// 反馈读取帧（位置..电压，14 字节）
pub fn read_feedback(id: OpenServoId) -> Vec<u8> {
    read_registers(id, FEEDBACK_FIRST, FEEDBACK_LEN)
}

/// 移动到目标位置：大端写入 SEEK_HI/SEEK_LO
pub fn move_to(id: OpenServoId, position: u16) -> Result<Vec<u8>, ProtocolError> {
    write_words(id, Register::SeekHi, &[position])
}

/// 把响应数据按大端字解码（奇数尾字节忽略）
pub fn decode_words(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| u16_from_be(pair[0], pair[1]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PacketFormat, parse_frame};

    fn id(rs485: u8, i2c: u8) -> OpenServoId {
        OpenServoId::new(rs485, i2c).unwrap()
    }

    #[test]
    fn test_id_bounds() {
        assert!(OpenServoId::new(253, 126).is_ok());
        assert!(OpenServoId::new(254, 1).is_err());
        assert!(OpenServoId::new(1, 127).is_err());
        assert_eq!(id(3, 16).to_string(), "3::16");
    }

    #[test]
    fn test_read_registers_layout() {
        let frame = read_registers(id(1, 0x10), Register::PositionHi, 14);
        assert_eq!(
            &frame[..9],
            &[0xFF, 0xFF, 0x01, 0x06, 0x02, 14, 0x20, 0x08, 0x21]
        );
        assert_eq!(frame.len(), 10);
        assert!(parse_frame(&frame, 0).is_ok());
        assert_eq!(read_feedback(id(1, 0x10)), frame);
    }

    #[test]
    fn test_write_registers_layout() {
        let frame = write_registers(id(2, 0x11), Register::Reverse, &[1]).unwrap();
        assert_eq!(
            &frame[..9],
            &[0xFF, 0xFF, 0x02, 0x06, 0x03, 0x00, 0x22, 48, 0x01]
        );
        assert_eq!(frame.len(), 10);
        assert!(parse_frame(&frame, 0).is_ok());
    }

    #[test]
    fn test_send_commands_layout() {
        let frame = send_commands(id(2, 0x11), &[Command::PwmDisable]).unwrap();
        assert_eq!(&frame[..8], &[0xFF, 0xFF, 0x02, 0x05, 0x02, 0x00, 0x22, 0x83]);
        assert_eq!(frame.len(), 9);
        assert!(parse_frame(&frame, 0).is_ok());
    }

    #[test]
    fn test_move_to_big_endian() {
        let frame = move_to(id(1, 1), 0x1234).unwrap();
        assert_eq!(&frame[7..10], &[0x10, 0x12, 0x34]);
    }

    #[test]
    fn test_feedback_len() {
        assert_eq!(FEEDBACK_LEN, 14);
        assert_eq!(PacketFormat::OpenServo.frame_len(FEEDBACK_LEN as usize), 19);
    }

    #[test]
    fn test_decode_words() {
        assert_eq!(decode_words(&[0x01, 0x02, 0x00, 0xFF, 0x07]), vec![0x0102, 0x00FF]);
    }

    #[test]
    fn test_register_conversion() {
        assert_eq!(Register::try_from(0x21).unwrap(), Register::PidDeadband);
        assert!(Register::try_from(0x16).is_err());
        assert_eq!(Command::try_from(0x90).unwrap(), Command::VoltageRead);
    }
}
