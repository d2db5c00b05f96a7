//! 舵机族
//!
//! 两个舵机族共用同一个控制循环和命令队列，但各自有独立的编解码
//! 和缓存。`ServoFamily` 描述一个舵机族在循环中需要的全部差异：
//! 反馈读取请求、反馈解码、批量移动帧、力矩开关命令。

use crate::command::PendingCommand;
use crate::mover;
use crate::settings::ControlSettings;
use crate::state::{FeedbackSnapshot, ServoCacheEntry, ServoId};
use servo_protocol::dynamixel::{self, DynamixelId, Register, SyncMoveEntry};
use servo_protocol::openservo::{self, OpenServoId};
use servo_protocol::{Packet, PacketFormat, ProtocolError};
use std::time::Instant;

/// 一个同步写帧最多容纳的舵机数（长度字节上限 255）
const MAX_SYNC_ENTRIES: usize = 50;

/// 反馈读取的寄存器范围
pub const FEEDBACK_FIRST: Register = Register::CurrentPosition;
pub const FEEDBACK_LAST: Register = Register::CurrentTemperature;

pub trait ServoFamily: Send + Sync + 'static {
    type Id: ServoId;

    const NAME: &'static str;
    const FORMAT: PacketFormat;
    /// 每次读取后都把读取机会让给下一个舵机族
    const HAND_OFF_AFTER_READ: bool;

    /// 一次读取的舵机数量
    fn read_batch_size(settings: &ControlSettings) -> usize;

    /// 每隔多少轮读取一次
    fn read_divider(settings: &ControlSettings) -> u32;

    /// 反馈读取请求，返回 `(request, 每个响应的数据字节数)`
    fn feedback_request(ids: &[Self::Id]) -> Result<(Vec<u8>, usize), ProtocolError>;

    /// 把一个响应包解码为反馈；无效的行返回 `None`
    fn decode_feedback(
        ids: &[Self::Id],
        packet: &Packet,
        at: Instant,
    ) -> Option<FeedbackSnapshot<Self::Id>>;

    /// 为一组条目构建移动帧
    fn build_move(
        entries: &[&ServoCacheEntry<Self::Id>],
        settings: &ControlSettings,
        now: Instant,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// 开/关力矩的命令
    fn torque_command(id: Self::Id, enabled: bool) -> Result<PendingCommand, ProtocolError>;
}

/// 寄存器寻址舵机族
#[derive(Debug, Clone, Copy)]
pub struct Dynamixel;

impl ServoFamily for Dynamixel {
    type Id = DynamixelId;

    const NAME: &'static str = "dynamixel";
    const FORMAT: PacketFormat = PacketFormat::Dynamixel;
    const HAND_OFF_AFTER_READ: bool = false;

    fn read_batch_size(settings: &ControlSettings) -> usize {
        settings.read_count.max(1)
    }

    fn read_divider(_settings: &ControlSettings) -> u32 {
        1
    }

    fn feedback_request(ids: &[DynamixelId]) -> Result<(Vec<u8>, usize), ProtocolError> {
        let (request, byte_count) =
            dynamixel::build_multi_read(ids, FEEDBACK_FIRST, FEEDBACK_LAST)?;
        Ok((request, byte_count as usize))
    }

    fn decode_feedback(
        ids: &[DynamixelId],
        packet: &Packet,
        at: Instant,
    ) -> Option<FeedbackSnapshot<DynamixelId>> {
        // 带状态错误（如过热）的包仍然携带有效数据
        let servo_id = ids.iter().copied().find(|id| id.value() == packet.id)?;
        let values =
            dynamixel::decode_registers(&packet.data, FEEDBACK_FIRST, FEEDBACK_LAST).ok()?;
        if values.iter().all(|v| *v == 0) {
            return None;
        }
        Some(FeedbackSnapshot {
            servo_id,
            position: values[0],
            speed: dynamixel::signed_magnitude(values[1]),
            load: dynamixel::signed_magnitude(values[2]),
            voltage: values[3],
            temperature: values[4],
            updated_at: at,
        })
    }

    fn build_move(
        entries: &[&ServoCacheEntry<DynamixelId>],
        settings: &ControlSettings,
        now: Instant,
    ) -> Result<Vec<u8>, ProtocolError> {
        let moves: Vec<SyncMoveEntry> = entries
            .iter()
            .filter_map(|entry| {
                let goal = entry.goal()?;
                let speed = mover::plan_entry_speed(entry, now, settings)?;
                tracing::trace!(
                    servo_id = %entry.servo_id(),
                    goal = goal.goal_position,
                    current = entry.feedback().position,
                    speed,
                    "Planned move"
                );
                Some(SyncMoveEntry {
                    id: entry.servo_id(),
                    goal_position: goal.goal_position,
                    moving_speed: speed,
                })
            })
            .collect();

        let mut frames = Vec::new();
        for chunk in moves.chunks(MAX_SYNC_ENTRIES) {
            frames.extend(dynamixel::build_sync_move(chunk)?);
        }
        Ok(frames)
    }

    fn torque_command(id: DynamixelId, enabled: bool) -> Result<PendingCommand, ProtocolError> {
        let request = dynamixel::write_register(id, Register::TorqueEnable, enabled as u16)?;
        Ok(PendingCommand::new(request, PacketFormat::Dynamixel).expect_responses(1, 0))
    }
}

/// 总线寻址舵机族
#[derive(Debug, Clone, Copy)]
pub struct OpenServo;

/// OpenServo 反馈字序号
mod os_word {
    pub const POSITION: usize = 0;
    pub const SPEED: usize = 1;
    pub const LOAD: usize = 2;
    pub const VOLTAGE: usize = 6;
}

impl ServoFamily for OpenServo {
    type Id = OpenServoId;

    const NAME: &'static str = "openservo";
    const FORMAT: PacketFormat = PacketFormat::OpenServo;
    const HAND_OFF_AFTER_READ: bool = true;

    fn read_batch_size(_settings: &ControlSettings) -> usize {
        // 响应只带 RS485 地址，一次只读一个才能区分 I2C 地址
        1
    }

    fn read_divider(settings: &ControlSettings) -> u32 {
        settings.openservo_read_divider.max(1)
    }

    fn feedback_request(ids: &[OpenServoId]) -> Result<(Vec<u8>, usize), ProtocolError> {
        let request = ids
            .iter()
            .flat_map(|id| openservo::read_feedback(*id))
            .collect();
        Ok((request, openservo::FEEDBACK_LEN as usize))
    }

    fn decode_feedback(
        ids: &[OpenServoId],
        packet: &Packet,
        at: Instant,
    ) -> Option<FeedbackSnapshot<OpenServoId>> {
        let servo_id = ids.iter().copied().find(|id| id.rs485() == packet.id)?;
        if packet.data.len() < openservo::FEEDBACK_LEN as usize {
            return None;
        }
        let words = openservo::decode_words(&packet.data);
        Some(FeedbackSnapshot {
            servo_id,
            position: words[os_word::POSITION],
            speed: words[os_word::SPEED] as i16 as i32,
            load: words[os_word::LOAD] as i32,
            voltage: words[os_word::VOLTAGE],
            temperature: 0,
            updated_at: at,
        })
    }

    fn build_move(
        entries: &[&ServoCacheEntry<OpenServoId>],
        _settings: &ControlSettings,
        _now: Instant,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut frames = Vec::new();
        for entry in entries {
            if let Some(goal) = entry.goal() {
                frames.extend(openservo::move_to(entry.servo_id(), goal.goal_position)?);
            }
        }
        Ok(frames)
    }

    fn torque_command(id: OpenServoId, enabled: bool) -> Result<PendingCommand, ProtocolError> {
        let command = if enabled {
            openservo::Command::PwmEnable
        } else {
            openservo::Command::PwmDisable
        };
        let request = openservo::send_commands(id, &[command])?;
        Ok(PendingCommand::new(request, PacketFormat::OpenServo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::GoalSnapshot;
    use servo_protocol::{encode_frame, parse_frame};
    use std::time::Duration;

    fn dxl(v: u8) -> DynamixelId {
        DynamixelId::new(v).unwrap()
    }

    fn status_packet(id: u8, status: u8, data: &[u8]) -> Packet {
        Packet {
            id,
            status,
            data: data.to_vec(),
            error: status != 0,
        }
    }

    #[test]
    fn test_dynamixel_feedback_request() {
        let (request, size) = Dynamixel::feedback_request(&[dxl(1), dxl(2)]).unwrap();
        assert_eq!(size, 8);
        assert_eq!(request.len(), 16);
        assert_eq!(PacketFormat::Dynamixel.frame_len(size), 14);
    }

    #[test]
    fn test_dynamixel_decode_feedback() {
        let at = Instant::now();
        // pos 0x200, speed 0x410 (负 16), load 0x005, 电压 120, 温度 45
        let packet = status_packet(2, 0, &[0x00, 0x02, 0x10, 0x04, 0x05, 0x00, 120, 45]);
        let fb = Dynamixel::decode_feedback(&[dxl(1), dxl(2)], &packet, at).unwrap();
        assert_eq!(fb.servo_id, dxl(2));
        assert_eq!(fb.position, 0x200);
        assert_eq!(fb.speed, -16);
        assert_eq!(fb.load, 5);
        assert_eq!(fb.voltage, 120);
        assert_eq!(fb.temperature, 45);
        assert_eq!(fb.updated_at, at);
    }

    #[test]
    fn test_dynamixel_decode_rejects_bad_rows() {
        let at = Instant::now();
        let zeros = status_packet(1, 0, &[0; 8]);
        assert!(Dynamixel::decode_feedback(&[dxl(1)], &zeros, at).is_none());

        let short = status_packet(1, 0, &[1, 2, 3]);
        assert!(Dynamixel::decode_feedback(&[dxl(1)], &short, at).is_none());

        let unknown = status_packet(9, 0, &[1; 8]);
        assert!(Dynamixel::decode_feedback(&[dxl(1)], &unknown, at).is_none());
    }

    #[test]
    fn test_dynamixel_decode_keeps_overheating_packet() {
        let packet = status_packet(1, 0x04, &[0x00, 0x02, 0, 0, 0, 0, 120, 80]);
        let fb = Dynamixel::decode_feedback(&[dxl(1)], &packet, Instant::now()).unwrap();
        assert_eq!(fb.temperature, 80);
    }

    #[test]
    fn test_dynamixel_build_move() {
        let now = Instant::now();
        let mut entry = ServoCacheEntry::from_goal(GoalSnapshot::new(
            dxl(3),
            600,
            now + Duration::from_millis(500),
        ));
        entry.merge_feedback(FeedbackSnapshot {
            servo_id: dxl(3),
            position: 500,
            speed: 0,
            load: 0,
            voltage: 120,
            temperature: 40,
            updated_at: now,
        });
        let frames = Dynamixel::build_move(&[&entry], &ControlSettings::default(), now).unwrap();
        let frame = parse_frame(&frames, 0).unwrap();
        assert_eq!(frame.id, dynamixel::BROADCAST_ID);
        assert_eq!(frame.payload[0], 0x83);
        assert_eq!(frame.payload[3], 3);
        assert_eq!(u16::from_le_bytes([frame.payload[4], frame.payload[5]]), 600);
        let speed = u16::from_le_bytes([frame.payload[6], frame.payload[7]]);
        assert!((mover::MIN_SPEED..=mover::MAX_SPEED).contains(&speed));
    }

    #[test]
    fn test_dynamixel_build_move_chunks_large_batches() {
        let now = Instant::now();
        let entries: Vec<_> = (0..60u8)
            .map(|i| ServoCacheEntry::from_goal(GoalSnapshot::new(dxl(i), 100, now)))
            .collect();
        let refs: Vec<_> = entries.iter().collect();
        let frames = Dynamixel::build_move(&refs, &ControlSettings::default(), now).unwrap();
        let first = parse_frame(&frames, 0).unwrap();
        let second = parse_frame(&frames, first.wire_len()).unwrap();
        assert_eq!((first.payload.len() - 3) / 5, 50);
        assert_eq!((second.payload.len() - 3) / 5, 10);
    }

    #[test]
    fn test_dynamixel_torque_command() {
        let cmd = Dynamixel::torque_command(dxl(5), false).unwrap();
        assert_eq!(cmd.response_count(), 1);
        assert_eq!(
            cmd.request(),
            dynamixel::write_register(dxl(5), Register::TorqueEnable, 0)
                .unwrap()
                .as_slice()
        );
    }

    #[test]
    fn test_openservo_decode_feedback() {
        let id = OpenServoId::new(1, 0x10).unwrap();
        let mut data = vec![];
        for word in [0x0800u16, 0xFFF0, 0x0010, 0x0000, 0x0900, 0x0100, 0x1F40] {
            data.extend(word.to_be_bytes());
        }
        let frame = encode_frame(1, &data).unwrap();
        let packet = PacketFormat::OpenServo.parse(&frame, 0, data.len()).unwrap();
        let fb = OpenServo::decode_feedback(&[id], &packet, Instant::now()).unwrap();
        assert_eq!(fb.position, 0x0800);
        assert_eq!(fb.speed, -16);
        assert_eq!(fb.load, 16);
        assert_eq!(fb.voltage, 0x1F40);
        assert_eq!(fb.temperature, 0);
        assert!(!fb.is_sentinel());
    }

    #[test]
    fn test_openservo_move_and_torque() {
        let id = OpenServoId::new(2, 3).unwrap();
        let entry = ServoCacheEntry::from_goal(GoalSnapshot::new(id, 0x0123, Instant::now()));
        let frames =
            OpenServo::build_move(&[&entry], &ControlSettings::default(), Instant::now()).unwrap();
        assert_eq!(frames, openservo::move_to(id, 0x0123).unwrap());

        let cmd = OpenServo::torque_command(id, false).unwrap();
        assert_eq!(cmd.response_count(), 0);
        assert_eq!(cmd.request()[7], u8::from(openservo::Command::PwmDisable));
    }
}
