//! 控制器门面
//!
//! `ServoController` 持有控制循环和两个舵机族的状态缓存，对上层提供：
//!
//! - 阻塞式命令（ping、读写寄存器、力矩开关），经命令队列由控制线程执行
//! - 目标提交（`set_goal_position` + `move_servos`），由控制线程批量下发
//! - 无锁的反馈读取
//!
//! 阻塞式命令不能在命令回调里调用（回调运行在控制线程上）。

use crate::cache::ConcurrentServoCache;
use crate::command::PendingCommand;
use crate::control_loop::{ControlLoop, ServoIdList};
use crate::error::DriverError;
use crate::metrics::{LoopMetrics, MetricsSnapshot};
use crate::settings::{ControlSettings, LoopSwitches};
use crate::state::{FeedbackSnapshot, GoalSnapshot};
use parking_lot::Mutex;
use servo_protocol::dynamixel::{self, DynamixelId, Register};
use servo_protocol::openservo::{self, Command, OpenServoId};
use servo_protocol::{Packet, PacketFormat};
use servo_serial::Transport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 阻塞式命令的默认等待时间
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

type RegisterCache = HashMap<DynamixelId, HashMap<Register, u16>>;

pub struct ServoController {
    control: ControlLoop,
    dynamixel: Arc<ConcurrentServoCache<DynamixelId>>,
    openservo: Arc<ConcurrentServoCache<OpenServoId>>,
    registers: Mutex<RegisterCache>,
    active: Mutex<ServoIdList>,
    command_timeout: Duration,
}

impl ServoController {
    /// 创建控制器（控制循环未启动）
    pub fn new(transport: Box<dyn Transport>, settings: ControlSettings) -> Self {
        let dynamixel = Arc::new(ConcurrentServoCache::new());
        let openservo = Arc::new(ConcurrentServoCache::new());
        let control = ControlLoop::new(transport, settings, dynamixel.clone(), openservo.clone());
        Self {
            control,
            dynamixel,
            openservo,
            registers: Mutex::new(HashMap::new()),
            active: Mutex::new(ServoIdList::default()),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    // ============================================================
    // 生命周期
    // ============================================================

    /// 探测并启动
    ///
    /// 逐个 ping 寄存器寻址舵机，无响应的只记录日志；响应的舵机写入
    /// `return_delay`。随后以响应的舵机和全部总线寻址舵机启动控制循环。
    ///
    /// # 返回
    /// 实际参与循环的舵机
    pub fn connect(&self, ids: &ServoIdList) -> Result<ServoIdList, DriverError> {
        let mut responsive = Vec::with_capacity(ids.dynamixel.len());
        for id in &ids.dynamixel {
            if self.ping(*id) {
                responsive.push(*id);
            } else {
                warn!(servo_id = %id, "Servo did not respond to ping");
            }
        }

        let return_delay = self.control.settings().return_delay as u16;
        for id in &responsive {
            if !self.write_register(*id, Register::ReturnDelay, return_delay) {
                debug!(servo_id = %id, "Failed to set return delay");
            }
        }

        let active = ServoIdList::new(responsive, ids.openservo.clone());
        info!(
            configured = ids.len(),
            active = active.len(),
            "Servo controller connecting"
        );
        self.start(&active)?;
        Ok(active)
    }

    /// 停止控制循环
    pub fn disconnect(&self) {
        self.stop();
    }

    /// 直接以给定舵机启动控制循环（不探测）
    pub fn start(&self, ids: &ServoIdList) -> Result<(), DriverError> {
        self.control.start(ids)?;
        *self.active.lock() = ids.clone();
        Ok(())
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// 当前参与循环的舵机
    pub fn active_servos(&self) -> ServoIdList {
        self.active.lock().clone()
    }

    // ============================================================
    // 命令
    // ============================================================

    /// 入队命令（不等待）
    pub fn enqueue(&self, command: PendingCommand) {
        self.control.enqueue(command);
    }

    /// 入队命令并等待响应
    pub fn execute(&self, command: PendingCommand) -> Result<Vec<Packet>, DriverError> {
        let (command, handle) = command.with_completion();
        self.control.enqueue(command);
        handle.wait(self.command_timeout)
    }

    /// 执行并取唯一的响应包
    fn execute_single(&self, request: Vec<u8>, data_len: usize) -> Option<Packet> {
        let command =
            PendingCommand::new(request, PacketFormat::Dynamixel).expect_responses(1, data_len);
        match self.execute(command) {
            Ok(packets) => packets.into_iter().next(),
            Err(e) => {
                debug!(error = %e, "Command failed");
                None
            },
        }
    }

    /// 收到该舵机的响应时为 true
    ///
    /// 带错误状态（如过热）的响应也算在线，错误位记录在日志中。
    pub fn ping(&self, id: DynamixelId) -> bool {
        let Some(packet) = self.execute_single(dynamixel::ping(id), 0) else {
            return false;
        };
        if packet.id != id.value() {
            return false;
        }
        if let Err(e) = check_status(id, &packet) {
            warn!(servo_id = %id, error = %e, "Servo responded to ping with error status");
        }
        true
    }

    /// 读取单个寄存器；可缓存的寄存器第一次读取后直接返回缓存值
    pub fn read_register(&self, id: DynamixelId, register: Register) -> Option<u16> {
        if register.info().cacheable
            && let Some(value) = self.cached_register(id, register)
        {
            return Some(value);
        }
        self.read_registers(id, register, register)
            .and_then(|values| values.first().copied())
    }

    /// 从总线读取 `[first..=last]`，结果写入寄存器缓存
    pub fn read_registers(
        &self,
        id: DynamixelId,
        first: Register,
        last: Register,
    ) -> Option<Vec<u16>> {
        let (request, byte_count) = match dynamixel::read_registers(id, first, last) {
            Ok(built) => built,
            Err(e) => {
                warn!(servo_id = %id, error = %e, "Invalid register range");
                return None;
            },
        };
        let packet = self.execute_single(request, byte_count as usize)?;
        if packet.id != id.value() {
            return None;
        }
        if let Err(e) = check_status(id, &packet) {
            debug!(servo_id = %id, error = %e, "Register read returned error status");
        }
        let values = dynamixel::decode_registers(&packet.data, first, last).ok()?;

        let registers = Register::range(first, last).ok()?;
        let mut cache = self.registers.lock();
        let servo = cache.entry(id).or_default();
        for (register, value) in registers.iter().zip(&values) {
            servo.insert(*register, *value);
        }
        Some(values)
    }

    /// 写单个寄存器
    ///
    /// - 同步寄存器（目标位置、移动速度）只写入缓存，随 `move_servos` 下发
    /// - 可缓存寄存器的值未变化时不访问总线
    pub fn write_register(&self, id: DynamixelId, register: Register, value: u16) -> bool {
        let info = register.info();
        if info.synchronized {
            self.registers.lock().entry(id).or_default().insert(register, value);
            return true;
        }
        if info.cacheable && self.cached_register(id, register) == Some(value) {
            return true;
        }

        let request = match dynamixel::write_register(id, register, value) {
            Ok(request) => request,
            Err(e) => {
                warn!(servo_id = %id, error = %e, "Invalid register write");
                return false;
            },
        };
        let ok = match self.execute_single(request, 0) {
            Some(packet) if packet.id == id.value() => match check_status(id, &packet) {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        servo_id = %id,
                        register = ?register,
                        error = %e,
                        "Register write rejected"
                    );
                    false
                },
            },
            _ => false,
        };
        if ok {
            self.registers.lock().entry(id).or_default().insert(register, value);
        }
        ok
    }

    /// 缓存中的寄存器值
    pub fn cached_register(&self, id: DynamixelId, register: Register) -> Option<u16> {
        self.registers
            .lock()
            .get(&id)
            .and_then(|servo| servo.get(&register).copied())
    }

    /// 开关力矩；关闭的舵机不再参与批量移动
    pub fn set_torque_enabled(&self, id: DynamixelId, enabled: bool) -> bool {
        let ok = self.write_register(id, Register::TorqueEnable, enabled as u16);
        if ok {
            self.dynamixel.set_enabled(id, enabled);
        }
        ok
    }

    // ============================================================
    // 运动
    // ============================================================

    /// 缓冲目标位置
    pub fn set_goal_position(&self, id: DynamixelId, position: u16) -> bool {
        self.write_register(id, Register::GoalPosition, position)
    }

    /// 把缓冲的目标位置作为一批目标提交，在 `duration` 后到达
    ///
    /// # 返回
    /// 提交的目标数量（没有缓冲目标位置的舵机被忽略）
    pub fn move_servos(&self, ids: &[DynamixelId], duration: Duration) -> usize {
        let target_time = Instant::now() + duration;
        let goals: Vec<_> = {
            let cache = self.registers.lock();
            ids.iter()
                .filter_map(|id| {
                    let position = cache.get(id)?.get(&Register::GoalPosition)?;
                    Some(GoalSnapshot::new(*id, *position, target_time))
                })
                .collect()
        };
        let count = goals.len();
        self.dynamixel.submit_goals(goals);
        count
    }

    /// 对所有参与循环的寄存器寻址舵机调用 `move_servos`
    pub fn move_all_servos(&self, duration: Duration) -> usize {
        let ids = self.active.lock().dynamixel.clone();
        self.move_servos(&ids, duration)
    }

    /// 直接提交寄存器寻址舵机的目标
    pub fn submit_goals<I>(&self, goals: I)
    where
        I: IntoIterator<Item = GoalSnapshot<DynamixelId>>,
    {
        self.dynamixel.submit_goals(goals);
    }

    // ============================================================
    // 总线寻址舵机
    // ============================================================

    fn execute_openservo(&self, request: Vec<u8>) -> bool {
        self.execute(PendingCommand::new(request, PacketFormat::OpenServo))
            .is_ok()
    }

    pub fn openservo_enable(&self, id: OpenServoId) -> bool {
        let ok = openservo::send_commands(id, &[Command::PwmEnable])
            .is_ok_and(|request| self.execute_openservo(request));
        if ok {
            self.openservo.set_enabled(id, true);
        }
        ok
    }

    pub fn openservo_disable(&self, id: OpenServoId) -> bool {
        let ok = openservo::send_commands(id, &[Command::PwmDisable])
            .is_ok_and(|request| self.execute_openservo(request));
        if ok {
            self.openservo.set_enabled(id, false);
        }
        ok
    }

    pub fn openservo_write_registers(
        &self,
        id: OpenServoId,
        first: openservo::Register,
        data: &[u8],
    ) -> bool {
        match openservo::write_registers(id, first, data) {
            Ok(request) => self.execute_openservo(request),
            Err(e) => {
                warn!(servo_id = %id, error = %e, "Invalid register write");
                false
            },
        }
    }

    pub fn openservo_write_words(
        &self,
        id: OpenServoId,
        first: openservo::Register,
        words: &[u16],
    ) -> bool {
        match openservo::write_words(id, first, words) {
            Ok(request) => self.execute_openservo(request),
            Err(e) => {
                warn!(servo_id = %id, error = %e, "Invalid register write");
                false
            },
        }
    }

    /// 提交目标，在 `duration` 后到达
    pub fn openservo_move(&self, id: OpenServoId, position: u16, duration: Duration) {
        self.openservo
            .submit_goals([GoalSnapshot::in_duration(id, position, duration)]);
    }

    // ============================================================
    // 状态
    // ============================================================

    /// 最近一次读取的反馈（无锁）
    pub fn read_cached_feedback(&self, id: DynamixelId) -> Option<FeedbackSnapshot<DynamixelId>> {
        self.dynamixel.read_cached_feedback(id)
    }

    pub fn read_cached_openservo_feedback(
        &self,
        id: OpenServoId,
    ) -> Option<FeedbackSnapshot<OpenServoId>> {
        self.openservo.read_cached_feedback(id)
    }

    pub fn dynamixel_cache(&self) -> &Arc<ConcurrentServoCache<DynamixelId>> {
        &self.dynamixel
    }

    pub fn openservo_cache(&self) -> &Arc<ConcurrentServoCache<OpenServoId>> {
        &self.openservo
    }

    pub fn settings(&self) -> &ControlSettings {
        self.control.settings()
    }

    pub fn switches(&self) -> &LoopSwitches {
        self.control.switches()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.control.metrics().snapshot()
    }

    pub fn loop_metrics(&self) -> &LoopMetrics {
        self.control.metrics()
    }

    /// 手动执行一个周期（循环未运行时使用）
    pub fn run_cycle(&self) {
        self.control.run_cycle();
    }
}

/// 状态字节中有错误位时返回 `ServoStatus`
fn check_status(id: DynamixelId, packet: &Packet) -> Result<(), DriverError> {
    if dynamixel::status_error(packet).is_empty() {
        return Ok(());
    }
    Err(DriverError::ServoStatus {
        servo: id.to_string(),
        status: packet.status,
    })
}
