//! 寄存器寻址舵机（Dynamixel RX 系列）
//!
//! 包括 id、指令集、状态错误位、控制表（寄存器表）和报文构建。
//! 2 字节寄存器为小端字节序。

use crate::frame::{Packet, encode_frame};
use crate::{ProtocolError, u16_from_le};
use bilge::prelude::*;
use std::fmt;

/// 最大合法舵机 id
pub const MAX_SERVO_ID: u8 = 253;

/// 广播 id（仅用于同步写，不会有响应）
pub const BROADCAST_ID: u8 = 0xFE;

/// 舵机 id（0..=253）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
pub struct DynamixelId(u8);

impl DynamixelId {
    pub fn new(id: u8) -> Result<Self, ProtocolError> {
        if id > MAX_SERVO_ID {
            return Err(ProtocolError::InvalidServoId(id));
        }
        Ok(Self(id))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for DynamixelId {
    type Error = ProtocolError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<DynamixelId> for u8 {
    fn from(id: DynamixelId) -> u8 {
        id.0
    }
}

impl fmt::Display for DynamixelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 指令
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[repr(u8)]
pub enum Instruction {
    Ping = 0x01,
    ReadData = 0x02,
    WriteData = 0x03,
    RegWrite = 0x04,
    Action = 0x05,
    Reset = 0x06,
    SyncWrite = 0x83,
}

/// 状态包错误字节（位域）
///
/// Bit 0: 输入电压
/// Bit 1: 角度限制
/// Bit 2: 过热
/// Bit 3: 超出范围
/// Bit 4: 校验和
/// Bit 5: 过载
/// Bit 6: 非法指令
/// Bit 7: 保留
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusError {
    pub input_voltage: bool,
    pub angle_limit: bool,
    pub overheating: bool,
    pub range: bool,
    pub checksum: bool,
    pub overload: bool,
    pub instruction: bool,
    pub reserved: u1,
}

impl StatusError {
    /// 从状态字节解析
    pub fn from_status(status: u8) -> Self {
        StatusError::from(u8::new(status))
    }

    pub fn is_empty(&self) -> bool {
        u8::from(*self) == 0
    }

    /// 已置位的错误名（用于日志）
    pub fn names(&self) -> smallvec::SmallVec<[&'static str; 7]> {
        let mut names = smallvec::SmallVec::new();
        let flags = [
            (self.input_voltage(), "input_voltage"),
            (self.angle_limit(), "angle_limit"),
            (self.overheating(), "overheating"),
            (self.range(), "range"),
            (self.checksum(), "checksum"),
            (self.overload(), "overload"),
            (self.instruction(), "instruction"),
        ];
        for (set, name) in flags {
            if set {
                names.push(name);
            }
        }
        names
    }
}

/// 寄存器描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterInfo {
    /// 控制表地址
    pub address: u8,
    /// 宽度（1 或 2 字节）
    pub width: u8,
    /// 可缓存（非易失）
    pub cacheable: bool,
    /// 同步写寄存器：只缓冲，随批量移动一起下发
    pub synchronized: bool,
}

/// 控制表寄存器（按地址顺序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Register {
    ModelNumber,
    FirmwareVersion,
    Id,
    BaudRate,
    ReturnDelay,
    CwAngleLimit,
    CcwAngleLimit,
    TemperatureLimit,
    LowVoltageLimit,
    HighVoltageLimit,
    MaxTorque,
    StatusReturnLevel,
    AlarmLed,
    AlarmShutdown,
    TorqueEnable,
    Led,
    CwComplianceMargin,
    CcwComplianceMargin,
    CwComplianceSlope,
    CcwComplianceSlope,
    GoalPosition,
    MovingSpeed,
    TorqueLimit,
    CurrentPosition,
    CurrentSpeed,
    CurrentLoad,
    CurrentVoltage,
    CurrentTemperature,
    RegisteredInstruction,
    Moving,
    Lock,
    Punch,
}

impl Register {
    /// 全部寄存器，按序号排列
    pub const ALL: [Register; 32] = [
        Register::ModelNumber,
        Register::FirmwareVersion,
        Register::Id,
        Register::BaudRate,
        Register::ReturnDelay,
        Register::CwAngleLimit,
        Register::CcwAngleLimit,
        Register::TemperatureLimit,
        Register::LowVoltageLimit,
        Register::HighVoltageLimit,
        Register::MaxTorque,
        Register::StatusReturnLevel,
        Register::AlarmLed,
        Register::AlarmShutdown,
        Register::TorqueEnable,
        Register::Led,
        Register::CwComplianceMargin,
        Register::CcwComplianceMargin,
        Register::CwComplianceSlope,
        Register::CcwComplianceSlope,
        Register::GoalPosition,
        Register::MovingSpeed,
        Register::TorqueLimit,
        Register::CurrentPosition,
        Register::CurrentSpeed,
        Register::CurrentLoad,
        Register::CurrentVoltage,
        Register::CurrentTemperature,
        Register::RegisteredInstruction,
        Register::Moving,
        Register::Lock,
        Register::Punch,
    ];

    pub fn info(self) -> RegisterInfo {
        use Register::*;
        let (address, width, cacheable, synchronized) = match self {
            ModelNumber => (0, 2, true, false),
            FirmwareVersion => (2, 1, true, false),
            Id => (3, 1, true, false),
            BaudRate => (4, 1, true, false),
            ReturnDelay => (5, 1, true, false),
            CwAngleLimit => (6, 2, true, false),
            CcwAngleLimit => (8, 2, true, false),
            TemperatureLimit => (11, 1, true, false),
            LowVoltageLimit => (12, 1, true, false),
            HighVoltageLimit => (13, 1, true, false),
            MaxTorque => (14, 2, true, false),
            StatusReturnLevel => (16, 1, true, false),
            AlarmLed => (17, 1, true, false),
            AlarmShutdown => (18, 1, true, false),
            TorqueEnable => (24, 1, false, false),
            Led => (25, 1, false, false),
            CwComplianceMargin => (26, 1, true, false),
            CcwComplianceMargin => (27, 1, true, false),
            CwComplianceSlope => (28, 1, true, false),
            CcwComplianceSlope => (29, 1, true, false),
            GoalPosition => (30, 2, true, true),
            MovingSpeed => (32, 2, true, true),
            TorqueLimit => (34, 2, true, false),
            CurrentPosition => (36, 2, false, false),
            CurrentSpeed => (38, 2, false, false),
            CurrentLoad => (40, 2, false, false),
            CurrentVoltage => (42, 1, false, false),
            CurrentTemperature => (43, 1, false, false),
            RegisteredInstruction => (44, 1, false, false),
            Moving => (46, 1, false, false),
            Lock => (47, 1, false, false),
            Punch => (48, 2, true, false),
        };
        RegisterInfo {
            address,
            width,
            cacheable,
            synchronized,
        }
    }

    pub fn address(self) -> u8 {
        self.info().address
    }

    pub fn width(self) -> u8 {
        self.info().width
    }

    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// `[first..=last]` 之间的寄存器（按序号）
    pub fn range(first: Register, last: Register) -> Result<&'static [Register], ProtocolError> {
        if first > last {
            return Err(ProtocolError::InvalidRegisterRange {
                first: format!("{first:?}"),
                last: format!("{last:?}"),
            });
        }
        Ok(&Register::ALL[first.ordinal()..=last.ordinal()])
    }

    /// `[first..=last]` 读取所需的字节数
    pub fn byte_span(first: Register, last: Register) -> Result<u8, ProtocolError> {
        Register::range(first, last)?;
        Ok(last.address() - first.address() + last.width())
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 构建指令帧：`FF FF id (params+2) ins params.. chk`
///
/// `id` 允许广播地址。
pub fn build_instruction(
    id: u8,
    instruction: Instruction,
    params: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Vec::with_capacity(params.len() + 1);
    body.push(instruction.into());
    body.extend_from_slice(params);
    encode_frame(id, &body)
}

/// Ping 帧（期望 1 个无参数响应）
pub fn ping(id: DynamixelId) -> Vec<u8> {
    let ins: u8 = Instruction::Ping.into();
    let len = 2u8;
    vec![
        0xFF,
        0xFF,
        id.value(),
        len,
        ins,
        crate::checksum(&[id.value(), len, ins]),
    ]
}

/// 读寄存器帧，返回 `(frame, byte_count)`
pub fn read_registers(
    id: DynamixelId,
    first: Register,
    last: Register,
) -> Result<(Vec<u8>, u8), ProtocolError> {
    let byte_count = Register::byte_span(first, last)?;
    let frame = build_instruction(
        id.value(),
        Instruction::ReadData,
        &[first.address(), byte_count],
    )?;
    Ok((frame, byte_count))
}

/// 写单个寄存器帧（2 字节寄存器小端）
pub fn write_register(
    id: DynamixelId,
    register: Register,
    value: u16,
) -> Result<Vec<u8>, ProtocolError> {
    let info = register.info();
    let [lo, hi] = value.to_le_bytes();
    if info.width == 1 && hi != 0 {
        return Err(ProtocolError::ValueOutOfRange {
            register: register.to_string(),
            width: info.width,
            value,
        });
    }
    let params: &[u8] = if info.width == 2 {
        &[info.address, lo, hi]
    } else {
        &[info.address, lo]
    };
    build_instruction(id.value(), Instruction::WriteData, params)
}

/// 批量读：每个 id 一个 ReadData 帧，首尾相连
///
/// 返回 `(frames, byte_count)`；每个 id 期望一个 `byte_count + 6` 字节的响应。
pub fn build_multi_read(
    ids: &[DynamixelId],
    first: Register,
    last: Register,
) -> Result<(Vec<u8>, u8), ProtocolError> {
    let byte_count = Register::byte_span(first, last)?;
    let mut frames = Vec::with_capacity(ids.len() * 8);
    for id in ids {
        frames.extend(build_instruction(
            id.value(),
            Instruction::ReadData,
            &[first.address(), byte_count],
        )?);
    }
    Ok((frames, byte_count))
}

/// 同步移动条目
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMoveEntry {
    pub id: DynamixelId,
    pub goal_position: u16,
    pub moving_speed: u16,
}

/// 每个舵机在同步写中的数据字节数（GoalPosition + MovingSpeed）
pub const SYNC_MOVE_DATA_LEN: u8 = 4;

/// 同步写移动帧
///
/// `FF FF FE len 83 1E 04 [id pos_lo pos_hi spd_lo spd_hi]* chk`
pub fn build_sync_move(entries: &[SyncMoveEntry]) -> Result<Vec<u8>, ProtocolError> {
    let mut params = Vec::with_capacity(2 + entries.len() * 5);
    params.push(Register::GoalPosition.address());
    params.push(SYNC_MOVE_DATA_LEN);
    for entry in entries {
        let [pos_lo, pos_hi] = entry.goal_position.to_le_bytes();
        let [spd_lo, spd_hi] = entry.moving_speed.to_le_bytes();
        params.extend_from_slice(&[entry.id.value(), pos_lo, pos_hi, spd_lo, spd_hi]);
    }
    build_instruction(BROADCAST_ID, Instruction::SyncWrite, &params)
}

/// 状态包中的错误位
pub fn status_error(packet: &Packet) -> StatusError {
    StatusError::from_status(packet.status)
}

/// 把读取到的数据按寄存器解码为数值（2 字节寄存器小端）
///
/// `data` 从 `first` 的地址开始。
pub fn decode_registers(
    data: &[u8],
    first: Register,
    last: Register,
) -> Result<Vec<u16>, ProtocolError> {
    let registers = Register::range(first, last)?;
    let base = first.address();
    let needed = Register::byte_span(first, last)? as usize;
    if data.len() < needed {
        return Err(ProtocolError::Truncated {
            offset: 0,
            needed,
            available: data.len(),
        });
    }
    Ok(registers
        .iter()
        .map(|reg| {
            let at = (reg.address() - base) as usize;
            if reg.width() == 2 {
                u16_from_le(data[at], data[at + 1])
            } else {
                data[at] as u16
            }
        })
        .collect())
}

/// 速度/负载寄存器：bit 10 为方向位，置位时为负
pub fn signed_magnitude(raw: u16) -> i32 {
    let magnitude = (raw & 0x3FF) as i32;
    if raw & 0x400 != 0 { -magnitude } else { magnitude }
}
