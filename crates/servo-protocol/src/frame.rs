//! 通用帧格式
//!
//! 负责帧外壳的构建、校验和计算、单帧解析，以及在接收缓冲区中
//! 逐帧扫描（`PacketCursor`）。两个舵机族的报文语义在各自模块中处理。

use crate::ProtocolError;
use crate::dynamixel::StatusError;
use tracing::{debug, warn};

/// 帧同步字
pub const SYNC: [u8; 2] = [0xFF, 0xFF];

/// 可解析帧的最小字节数（同步字 + id + len + checksum）
pub const MIN_FRAME_LEN: usize = 5;

/// 帧外壳开销：同步字(2) + id(1) + len(1) + checksum(1)
pub const FRAME_OVERHEAD: usize = 5;

/// 计算校验和：字节和取反，保留低 8 位
///
/// 调用方传入从 id 到最后一个参数字节的切片。
pub fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// 构建一帧：`FF FF id len body.. checksum`，其中 `len = body.len() + 1`
pub fn encode_frame(id: u8, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if body.len() + 1 > u8::MAX as usize {
        return Err(ProtocolError::FrameTooLong(body.len()));
    }
    let mut frame = Vec::with_capacity(body.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&SYNC);
    frame.push(id);
    frame.push((body.len() + 1) as u8);
    frame.extend_from_slice(body);
    frame.push(checksum(&frame[2..]));
    Ok(frame)
}

/// 校验通过的原始帧（借用接收缓冲区）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub id: u8,
    /// 帧中声明的长度字节
    pub length: u8,
    /// `length - 1` 字节的载荷（不含校验和）
    pub payload: &'a [u8],
}

impl RawFrame<'_> {
    /// 该帧在线上占用的总字节数
    pub fn wire_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }
}

/// 从 `offset` 处解析一帧
///
/// # 错误
///
/// - 不足 5 字节或缓冲区短于声明长度：`Truncated`
/// - 同步字不是 `FF FF`：`BadSync`，调用方需要重新同步
/// - 长度字节为 0：`InvalidLength`
/// - 校验和不匹配：`ChecksumMismatch`，该帧应丢弃
pub fn parse_frame(data: &[u8], offset: usize) -> Result<RawFrame<'_>, ProtocolError> {
    let available = data.len().saturating_sub(offset);
    if available < MIN_FRAME_LEN {
        return Err(ProtocolError::Truncated {
            offset,
            needed: MIN_FRAME_LEN,
            available,
        });
    }

    let frame = &data[offset..];
    if frame[..2] != SYNC {
        return Err(ProtocolError::BadSync {
            offset,
            first: frame[0],
            second: frame[1],
        });
    }

    let length = frame[3];
    if length == 0 {
        return Err(ProtocolError::InvalidLength(length));
    }

    let total = length as usize + 4;
    if available < total {
        return Err(ProtocolError::Truncated {
            offset,
            needed: total,
            available,
        });
    }

    let expected = checksum(&frame[2..total - 1]);
    let actual = frame[total - 1];
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }

    Ok(RawFrame {
        id: frame[2],
        length,
        payload: &frame[4..total - 1],
    })
}

/// 接收缓冲区扫描器
///
/// - 跳到下一个同步字
/// - 解析成功：越过整帧
/// - 校验失败或长度非法：越过同步字后继续扫描
/// - 帧被截断：停止，且不前移游标（后续字节可能还在路上）
#[derive(Debug, Clone)]
pub struct PacketCursor<'a> {
    data: &'a [u8],
    pos: usize,
    stalled: bool,
}

impl<'a> PacketCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::at(data, 0)
    }

    pub fn at(data: &'a [u8], offset: usize) -> Self {
        Self {
            data,
            pos: offset.min(data.len()),
            stalled: false,
        }
    }

    /// 当前游标位置
    pub fn position(&self) -> usize {
        self.pos
    }

    /// 游标后剩余的未消费字节
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// 是否因截断帧而停止
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    fn find_sync(&self) -> Option<usize> {
        let data = self.data;
        let mut i = self.pos;
        while i + 1 < data.len() {
            if data[i] == SYNC[0] && data[i + 1] == SYNC[1] {
                // `FF FF FF id`：id 永远不会是 0xFF，取最后一对
                while i + 2 < data.len() && data[i + 2] == 0xFF {
                    i += 1;
                }
                return Some(i);
            }
            i += 1;
        }
        None
    }
}

impl<'a> Iterator for PacketCursor<'a> {
    type Item = Result<RawFrame<'a>, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stalled {
            return None;
        }

        let Some(start) = self.find_sync() else {
            if self.pos < self.data.len() {
                debug!(
                    skipped = self.data.len() - self.pos,
                    "No sync bytes left in buffer"
                );
            }
            self.pos = self.data.len();
            return None;
        };
        if start > self.pos {
            debug!(skipped = start - self.pos, "Skipped bytes before sync");
        }
        self.pos = start;

        match parse_frame(self.data, start) {
            Ok(frame) => {
                self.pos = start + frame.wire_len();
                Some(Ok(frame))
            },
            Err(e @ ProtocolError::Truncated { .. }) => {
                self.stalled = true;
                Some(Err(e))
            },
            Err(e) => {
                debug!(offset = start, error = %e, "Dropping corrupt frame");
                self.pos = start + SYNC.len();
                Some(Err(e))
            },
        }
    }
}

/// 舵机族的响应报文格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PacketFormat {
    /// `FF FF id len error params.. chk`
    Dynamixel,
    /// `FF FF rs485 len data.. chk`
    OpenServo,
}

impl PacketFormat {
    /// 携带 `data_len` 字节数据的响应帧长度
    pub fn frame_len(self, data_len: usize) -> usize {
        match self {
            PacketFormat::Dynamixel => data_len + FRAME_OVERHEAD + 1,
            PacketFormat::OpenServo => data_len + FRAME_OVERHEAD,
        }
    }

    /// 把已校验的帧转换为响应报文
    ///
    /// 校验通过但数据短于 `expected_data` 时仍返回报文，只是标记为错误；
    /// 部分读（CPU 负载高时常见）的调用方可以自行决定是否采用。
    pub fn packet_from_frame(
        self,
        frame: &RawFrame<'_>,
        expected_data: usize,
    ) -> Result<Packet, ProtocolError> {
        if frame.id > crate::dynamixel::MAX_SERVO_ID {
            return Err(ProtocolError::InvalidServoId(frame.id));
        }

        let (status, data) = match self {
            PacketFormat::Dynamixel => match frame.payload.split_first() {
                Some((status, params)) => (*status, params),
                None => return Err(ProtocolError::InvalidLength(frame.length)),
            },
            PacketFormat::OpenServo => (0, frame.payload),
        };

        if status != 0 {
            warn!(
                servo_id = frame.id,
                status = format_args!("0x{:02X}", status),
                errors = ?StatusError::from_status(status).names().as_slice(),
                "Servo reported error status"
            );
        }
        let short = data.len() < expected_data;
        if short {
            debug!(
                servo_id = frame.id,
                expected = expected_data,
                actual = data.len(),
                "Short packet payload"
            );
        }

        Ok(Packet {
            id: frame.id,
            status,
            data: data.to_vec(),
            error: status != 0 || short,
        })
    }

    /// 从 `offset` 处解析一个响应报文
    pub fn parse(
        self,
        data: &[u8],
        offset: usize,
        expected_data: usize,
    ) -> Result<Packet, ProtocolError> {
        let frame = parse_frame(data, offset)?;
        self.packet_from_frame(&frame, expected_data)
    }
}

/// 已解析的响应报文
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Packet {
    /// 舵机 id（OpenServo 为 RS485 地址）
    pub id: u8,
    /// 状态字节（OpenServo 恒为 0）
    pub status: u8,
    /// 参数/数据字节
    pub data: Vec<u8>,
    /// 状态非零或数据短于预期
    pub error: bool,
}

impl Packet {
    pub fn has_error(&self) -> bool {
        self.error
    }
}
