//! 模拟舵机总线
//!
//! 用 `MockTransport` 的应答函数模拟一组寄存器寻址舵机和总线寻址舵机：
//! 解析请求帧，维护每个舵机的控制表，按协议回复状态包。
//! 总线寻址舵机按 RS485 地址区分，地址不能与寄存器寻址舵机的 id 重复。

#![allow(dead_code)]

use parking_lot::Mutex;
use servo_protocol::dynamixel::{BROADCAST_ID, Instruction, Register};
use servo_protocol::openservo;
use servo_protocol::{PacketCursor, encode_frame};
use servo_serial::mock::MockTransport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 单个模拟舵机的控制表
#[derive(Debug, Clone)]
pub struct SimServo {
    pub table: [u8; 50],
}

impl SimServo {
    pub fn new(position: u16, temperature: u8) -> Self {
        let mut servo = Self { table: [0; 50] };
        servo.set_word(Register::CurrentPosition, position);
        servo.table[Register::CurrentVoltage.address() as usize] = 120;
        servo.table[Register::CurrentTemperature.address() as usize] = temperature;
        servo.table[Register::TorqueEnable.address() as usize] = 1;
        servo
    }

    pub fn word(&self, register: Register) -> u16 {
        let at = register.address() as usize;
        u16::from_le_bytes([self.table[at], self.table[at + 1]])
    }

    pub fn set_word(&mut self, register: Register, value: u16) {
        let at = register.address() as usize;
        self.table[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn byte(&self, register: Register) -> u8 {
        self.table[register.address() as usize]
    }
}

#[derive(Debug, Default)]
pub struct BusState {
    pub servos: HashMap<u8, SimServo>,
    /// 收到的 (id, 寄存器地址, 值) 写入记录
    pub writes: Vec<(u8, u8, Vec<u8>)>,
    /// 收到的同步移动：(id, 目标位置, 速度)
    pub sync_moves: Vec<(u8, u16, u16)>,
    /// 总线寻址舵机的反馈字（位置、速度、负载、PWM、目标位置、目标速度、电压）
    pub openservo: HashMap<u8, [u16; 7]>,
    /// 总线寻址舵机收到的 (rs485, 寄存器地址, 数据) 写入记录
    pub openservo_writes: Vec<(u8, u8, Vec<u8>)>,
}

#[derive(Clone)]
pub struct SimBus {
    pub mock: MockTransport,
    pub state: Arc<Mutex<BusState>>,
}

impl SimBus {
    pub fn new(servos: &[(u8, SimServo)]) -> Self {
        let state = Arc::new(Mutex::new(BusState {
            servos: servos.iter().cloned().collect(),
            ..BusState::default()
        }));
        let responder_state = state.clone();
        let mock = MockTransport::with_responder(move |request| {
            respond(&mut responder_state.lock(), request)
        });
        Self { mock, state }
    }

    /// 加入一个总线寻址舵机
    pub fn add_openservo(&self, rs485: u8, words: [u16; 7]) {
        self.state.lock().openservo.insert(rs485, words);
    }

    /// 写到 SEEK 寄存器的目标位置
    pub fn openservo_seeks(&self, rs485: u8) -> Vec<u16> {
        self.state
            .lock()
            .openservo_writes
            .iter()
            .filter(|(servo, address, data)| {
                *servo == rs485
                    && *address == openservo::Register::SeekHi.address()
                    && data.len() >= 2
            })
            .map(|(_, _, data)| u16::from_be_bytes([data[0], data[1]]))
            .collect()
    }

    pub fn set_temperature(&self, id: u8, temperature: u8) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.table[Register::CurrentTemperature.address() as usize] = temperature;
        }
    }

    pub fn torque_writes(&self, id: u8) -> Vec<u8> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(servo, address, _)| {
                *servo == id && *address == Register::TorqueEnable.address()
            })
            .map(|(_, _, data)| data[0])
            .collect()
    }

    pub fn sync_moves(&self) -> Vec<(u8, u16, u16)> {
        self.state.lock().sync_moves.clone()
    }
}

fn status(id: u8, data: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8];
    body.extend_from_slice(data);
    encode_frame(id, &body).unwrap_or_default()
}

/// 总线寻址舵机的请求：读 `[2, len, i2c_w, reg, i2c_r]`，写 `[n, 0, i2c_w, reg, data..]`
fn respond_openservo(state: &mut BusState, rs485: u8, payload: &[u8]) -> Option<Vec<u8>> {
    let words = *state.openservo.get(&rs485)?;
    match payload {
        [2, len, _, register, _] if *len > 0 => {
            let data: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
            let start = register.checked_sub(openservo::FEEDBACK_FIRST.address())? as usize;
            let end = (start + *len as usize).min(data.len());
            encode_frame(rs485, data.get(start..end)?).ok()
        },
        [_, 0, _, register, data @ ..] => {
            state.openservo_writes.push((rs485, *register, data.to_vec()));
            None
        },
        _ => None,
    }
}

fn respond(state: &mut BusState, request: &[u8]) -> Option<Vec<u8>> {
    let mut reply = Vec::new();
    for frame in PacketCursor::new(request).flatten() {
        if state.openservo.contains_key(&frame.id) {
            reply.extend(respond_openservo(state, frame.id, frame.payload).unwrap_or_default());
            continue;
        }
        let Some((&instruction, params)) = frame.payload.split_first() else {
            continue;
        };
        let id = frame.id;
        match Instruction::try_from(instruction) {
            Ok(Instruction::Ping) if state.servos.contains_key(&id) => {
                reply.extend(status(id, &[]));
            },
            Ok(Instruction::ReadData) => {
                let Some(servo) = state.servos.get(&id) else {
                    continue;
                };
                let start = params[0] as usize;
                let len = params[1] as usize;
                reply.extend(status(id, &servo.table[start..start + len]));
            },
            Ok(Instruction::WriteData) => {
                let Some(servo) = state.servos.get_mut(&id) else {
                    continue;
                };
                let start = params[0] as usize;
                servo.table[start..start + params.len() - 1].copy_from_slice(&params[1..]);
                state.writes.push((id, params[0], params[1..].to_vec()));
                reply.extend(status(id, &[]));
            },
            Ok(Instruction::SyncWrite) if id == BROADCAST_ID => {
                let data_len = params[1] as usize;
                for chunk in params[2..].chunks_exact(data_len + 1) {
                    let goal = u16::from_le_bytes([chunk[1], chunk[2]]);
                    let speed = u16::from_le_bytes([chunk[3], chunk[4]]);
                    state.sync_moves.push((chunk[0], goal, speed));
                    if let Some(servo) = state.servos.get_mut(&chunk[0]) {
                        servo.set_word(Register::GoalPosition, goal);
                        servo.set_word(Register::CurrentPosition, goal);
                    }
                }
            },
            _ => {},
        }
    }
    (!reply.is_empty()).then_some(reply)
}

/// 轮询直到条件成立或超时
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
