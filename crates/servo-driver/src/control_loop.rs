//! 控制循环
//!
//! 单个后台线程独占串口。每个周期按固定顺序：
//!
//! 1. 过热检查（可能入队开/关力矩命令）
//! 2. 命令队列非空时执行一条命令，本周期结束
//! 3. 有未发送目标时批量发送移动，本周期结束
//! 4. 否则读取下一批舵机的反馈，两个舵机族轮流读取
//!
//! 周期内的任何错误或 panic 都被记录，退避后继续下一个周期。
//! 循环停止时，入队的命令在调用线程上同步执行。

use crate::cache::ConcurrentServoCache;
use crate::command::{CommandQueue, PendingCommand};
use crate::error::DriverError;
use crate::family::{Dynamixel, OpenServo, ServoFamily};
use crate::metrics::LoopMetrics;
use crate::settings::{ControlSettings, LoopSwitches};
use crate::temperature::TemperatureMonitor;
use parking_lot::Mutex;
use servo_protocol::dynamixel::DynamixelId;
use servo_protocol::openservo::OpenServoId;
use servo_protocol::{Packet, PacketCursor, PacketFormat};
use servo_serial::{SerialError, Transport};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 没有工作时的休眠
const IDLE_SLEEP: Duration = Duration::from_millis(1);
/// 清除错误前等待迟到字节
const RECOVER_SETTLE: Duration = Duration::from_millis(1);
/// 同一批舵机连续读取失败多少次后跳过
const MAX_READ_RETRIES: u32 = 3;
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// 参与循环的舵机
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServoIdList {
    pub dynamixel: Vec<DynamixelId>,
    pub openservo: Vec<OpenServoId>,
}

impl ServoIdList {
    pub fn new(dynamixel: Vec<DynamixelId>, openservo: Vec<OpenServoId>) -> Self {
        Self {
            dynamixel,
            openservo,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dynamixel.is_empty() && self.openservo.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dynamixel.len() + self.openservo.len()
    }
}

/// 按期望数量读取响应包
///
/// 总超时为 `per_packet * count`。读到的字节里无法解析的帧被跳过；
/// 返回的包可能少于 `count`，由调用方判断。
pub fn read_packets(
    transport: &mut dyn Transport,
    count: usize,
    data_len: usize,
    format: PacketFormat,
    per_packet: Duration,
) -> Result<Vec<Packet>, SerialError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; format.frame_len(data_len) * count];
    let n = transport.read_full(&mut buf, per_packet * count as u32)?;

    let mut packets = Vec::with_capacity(count);
    for item in PacketCursor::new(&buf[..n]) {
        match item.and_then(|frame| format.packet_from_frame(&frame, data_len)) {
            Ok(packet) => {
                packets.push(packet);
                if packets.len() == count {
                    break;
                }
            },
            Err(e) => debug!(error = %e, "Discarding response frame"),
        }
    }
    Ok(packets)
}

fn settle_and_recover(transport: &mut dyn Transport) {
    spin_sleep::sleep(RECOVER_SETTLE);
    transport.recover();
}

/// 一个周期内各阶段共享的只读上下文
struct CycleContext<'a> {
    settings: &'a ControlSettings,
    queue: &'a CommandQueue,
    metrics: &'a LoopMetrics,
}

/// 一次读取机会的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LaneTurn {
    /// 是否访问了总线
    read: bool,
    /// 是否把读取机会交给下一个舵机族
    hand_off: bool,
}

impl LaneTurn {
    const SKIPPED: LaneTurn = LaneTurn {
        read: false,
        hand_off: true,
    };
}

/// 控制循环眼中的一个舵机族
trait ServoLane: Send {
    fn cooldown(&mut self, ctx: &CycleContext<'_>) -> Result<(), DriverError>;

    fn move_pending(&self) -> bool;

    fn move_servos(
        &mut self,
        transport: &mut dyn Transport,
        ctx: &CycleContext<'_>,
    ) -> Result<(), DriverError>;

    fn update(
        &mut self,
        transport: &mut dyn Transport,
        ctx: &CycleContext<'_>,
    ) -> Result<LaneTurn, DriverError>;
}

struct FamilyLane<F: ServoFamily> {
    cache: Arc<ConcurrentServoCache<F::Id>>,
    ids: Vec<F::Id>,
    read_index: usize,
    read_tick: u32,
    failed_reads: u32,
    monitor: TemperatureMonitor<F>,
}

impl<F: ServoFamily> FamilyLane<F> {
    fn new(cache: Arc<ConcurrentServoCache<F::Id>>) -> Self {
        Self {
            cache,
            ids: Vec::new(),
            read_index: 0,
            read_tick: 0,
            failed_reads: 0,
            monitor: TemperatureMonitor::new(),
        }
    }

    fn assign(&mut self, ids: &[F::Id]) {
        self.ids.clear();
        for id in ids {
            if !self.ids.contains(id) {
                self.ids.push(*id);
            }
        }
        self.read_index = 0;
        self.read_tick = 0;
        self.failed_reads = 0;
    }

    fn advance(&mut self, end: usize) -> LaneTurn {
        let wrapped = end >= self.ids.len();
        self.read_index = if wrapped { 0 } else { end };
        LaneTurn {
            read: true,
            hand_off: wrapped || F::HAND_OFF_AFTER_READ,
        }
    }
}

impl<F: ServoFamily> ServoLane for FamilyLane<F> {
    fn cooldown(&mut self, ctx: &CycleContext<'_>) -> Result<(), DriverError> {
        self.monitor
            .check(&self.cache, ctx.settings, ctx.queue, ctx.metrics)
    }

    fn move_pending(&self) -> bool {
        self.cache.move_pending()
    }

    fn move_servos(
        &mut self,
        transport: &mut dyn Transport,
        ctx: &CycleContext<'_>,
    ) -> Result<(), DriverError> {
        let now = Instant::now();
        let mut view = self.cache.acquire_batch_view();

        let mut eligible: Vec<F::Id> = view
            .iter()
            .filter(|e| {
                e.has_due_goal() && !e.feedback().is_sentinel() && view.is_enabled(e.servo_id())
            })
            .map(|e| e.servo_id())
            .collect();
        if eligible.is_empty() {
            view.clear_move_pending();
            return Ok(());
        }
        eligible.sort();

        let frame = {
            let entries: Vec<_> = eligible.iter().filter_map(|id| view.get(*id)).collect();
            F::build_move(&entries, ctx.settings, now)?
        };

        match transport.send(&frame) {
            Ok(()) => {
                for id in &eligible {
                    if let Some(entry) = view.get_mut(*id) {
                        entry.goals_sent();
                    }
                }
                view.clear_move_pending();
                LoopMetrics::incr(&ctx.metrics.moves);
                trace!(family = F::NAME, servos = eligible.len(), "Move sent");
            },
            Err(e) => {
                LoopMetrics::incr(&ctx.metrics.move_failures);
                warn!(family = F::NAME, error = %e, "Move transmit failed");
                settle_and_recover(transport);
            },
        }
        Ok(())
    }

    fn update(
        &mut self,
        transport: &mut dyn Transport,
        ctx: &CycleContext<'_>,
    ) -> Result<LaneTurn, DriverError> {
        if self.ids.is_empty() {
            return Ok(LaneTurn::SKIPPED);
        }
        self.read_tick += 1;
        if self.read_tick < F::read_divider(ctx.settings) {
            return Ok(LaneTurn::SKIPPED);
        }
        self.read_tick = 0;

        let start = self.read_index.min(self.ids.len() - 1);
        let end = (start + F::read_batch_size(ctx.settings).max(1)).min(self.ids.len());
        let ids = &self.ids[start..end];

        let (request, data_len) = F::feedback_request(ids)?;
        LoopMetrics::incr(&ctx.metrics.reads);
        let at = Instant::now();
        let result = transport.send(&request).and_then(|()| {
            read_packets(transport, ids.len(), data_len, F::FORMAT, ctx.settings.timeout())
        });
        let feedback: Vec<_> = match result {
            Ok(packets) => packets
                .iter()
                .filter_map(|p| F::decode_feedback(ids, p, at))
                .collect(),
            Err(e) => {
                debug!(family = F::NAME, error = %e, "Feedback read failed");
                Vec::new()
            },
        };

        if feedback.len() < ids.len() {
            LoopMetrics::incr(&ctx.metrics.read_failures);
            trace!(
                family = F::NAME,
                expected = ids.len(),
                received = feedback.len(),
                "Short feedback read"
            );
            settle_and_recover(transport);
        }

        if feedback.is_empty() {
            self.failed_reads += 1;
            if self.failed_reads < MAX_READ_RETRIES {
                return Ok(LaneTurn {
                    read: true,
                    hand_off: false,
                });
            }
            debug!(
                family = F::NAME,
                first = %self.ids[start],
                "Skipping servos after repeated read failures"
            );
        } else {
            self.cache.submit_feedback(feedback);
        }
        self.failed_reads = 0;
        Ok(self.advance(end))
    }
}

/// 两个舵机族的读取状态
struct Lanes {
    dynamixel: FamilyLane<Dynamixel>,
    openservo: FamilyLane<OpenServo>,
    /// 当前持有读取机会的舵机族
    reading: usize,
}

impl Lanes {
    const COUNT: usize = 2;

    fn assign(&mut self, ids: &ServoIdList) {
        self.dynamixel.assign(&ids.dynamixel);
        self.openservo.assign(&ids.openservo);
        self.reading = 0;
    }

    fn all(&mut self) -> [&mut dyn ServoLane; Lanes::COUNT] {
        [&mut self.dynamixel, &mut self.openservo]
    }

    fn lane(&mut self, index: usize) -> &mut dyn ServoLane {
        match index {
            0 => &mut self.dynamixel,
            _ => &mut self.openservo,
        }
    }

    /// 给当前舵机族（必要时再给下一个）一次读取机会，返回是否访问了总线
    fn update(
        &mut self,
        transport: &mut dyn Transport,
        ctx: &CycleContext<'_>,
    ) -> Result<bool, DriverError> {
        for _ in 0..Lanes::COUNT {
            let turn = self.lane(self.reading).update(transport, ctx)?;
            if turn.hand_off {
                self.reading = (self.reading + 1) % Lanes::COUNT;
            }
            if turn.read {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

struct LoopShared {
    transport: Mutex<Box<dyn Transport>>,
    lanes: Mutex<Lanes>,
    queue: CommandQueue,
    running: AtomicBool,
    settings: ControlSettings,
    switches: LoopSwitches,
    metrics: LoopMetrics,
}

impl LoopShared {
    fn context(&self) -> CycleContext<'_> {
        CycleContext {
            settings: &self.settings,
            queue: &self.queue,
            metrics: &self.metrics,
        }
    }

    /// 执行一个周期，捕获错误和 panic
    fn step(&self) {
        let reason = match panic::catch_unwind(AssertUnwindSafe(|| self.cycle())) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };
        LoopMetrics::incr(&self.metrics.cycle_errors);
        warn!(error = %reason, "Recovering from error in control loop");
        spin_sleep::sleep(self.settings.error_backoff());
    }

    fn cycle(&self) -> Result<(), DriverError> {
        LoopMetrics::incr(&self.metrics.cycles);
        let ctx = self.context();
        let mut lanes = self.lanes.lock();

        for lane in lanes.all() {
            lane.cooldown(&ctx)?;
        }

        if self.switches.command_enabled() && self.execute_next() {
            return Ok(());
        }

        if self.switches.move_enabled() && lanes.all().iter().any(|l| l.move_pending()) {
            let mut transport = self.transport.lock();
            for lane in lanes.all() {
                if lane.move_pending() {
                    lane.move_servos(&mut **transport, &ctx)?;
                }
            }
            return Ok(());
        }

        if self.switches.update_enabled() {
            let mut transport = self.transport.lock();
            if lanes.update(&mut **transport, &ctx)? {
                return Ok(());
            }
        }

        drop(lanes);
        spin_sleep::sleep(IDLE_SLEEP);
        Ok(())
    }

    /// 执行队首命令；队列为空时返回 false
    fn execute_next(&self) -> bool {
        let Some(command) = self.queue.pop() else {
            return false;
        };
        let result = {
            let mut transport = self.transport.lock();
            self.transmit(&mut **transport, &command)
        };
        // 回调在释放串口后执行，允许回调里继续入队
        command.complete(result);
        true
    }

    fn drain(&self) {
        while self.execute_next() {}
    }

    fn transmit(
        &self,
        transport: &mut dyn Transport,
        command: &PendingCommand,
    ) -> Option<Vec<Packet>> {
        if let Err(e) = transport.send(command.request()) {
            LoopMetrics::incr(&self.metrics.command_failures);
            warn!(error = %e, "Command transmit failed");
            settle_and_recover(transport);
            return None;
        }
        LoopMetrics::incr(&self.metrics.commands_sent);

        let expected = command.response_count();
        if expected == 0 {
            return Some(Vec::new());
        }
        match read_packets(
            transport,
            expected,
            command.response_size(),
            command.format(),
            self.settings.timeout(),
        ) {
            Ok(packets) => {
                if packets.len() < expected {
                    LoopMetrics::incr(&self.metrics.command_failures);
                    debug!(expected, received = packets.len(), "Short command response");
                    settle_and_recover(transport);
                }
                Some(packets)
            },
            Err(e) => {
                LoopMetrics::incr(&self.metrics.command_failures);
                debug!(error = %e, "Command response read failed");
                settle_and_recover(transport);
                Some(Vec::new())
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}

fn run_loop(shared: Arc<LoopShared>) {
    #[cfg(feature = "realtime")]
    {
        use thread_priority::*;

        match set_current_thread_priority(ThreadPriority::Max) {
            Ok(_) => info!("Control thread priority set to MAX (realtime)"),
            Err(e) => warn!(
                "Failed to set control thread priority: {}. \
                On Linux, you may need to run with CAP_SYS_NICE or use rtkit.",
                e
            ),
        }
    }

    info!("Control loop started");
    while shared.running.load(Ordering::Acquire) {
        shared.step();
    }
    info!("Control loop exited");
}

trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> thread::Result<()>;
}

impl JoinTimeout for JoinHandle<()> {
    fn join_timeout(self, timeout: Duration) -> thread::Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = tx.send(self.join());
        });
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(Box::new("control thread did not exit in time")),
        }
    }
}

/// 控制循环句柄
///
/// drop 时停止后台线程。
pub struct ControlLoop {
    shared: Arc<LoopShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ControlLoop {
    pub fn new(
        transport: Box<dyn Transport>,
        settings: ControlSettings,
        dynamixel: Arc<ConcurrentServoCache<DynamixelId>>,
        openservo: Arc<ConcurrentServoCache<OpenServoId>>,
    ) -> Self {
        let switches = LoopSwitches::new(&settings);
        let shared = LoopShared {
            transport: Mutex::new(transport),
            lanes: Mutex::new(Lanes {
                dynamixel: FamilyLane::new(dynamixel),
                openservo: FamilyLane::new(openservo),
                reading: 0,
            }),
            queue: CommandQueue::new(),
            running: AtomicBool::new(false),
            settings,
            switches,
            metrics: LoopMetrics::new(),
        };
        Self {
            shared: Arc::new(shared),
            thread: Mutex::new(None),
        }
    }

    /// 启动后台线程；已在运行时什么都不做
    pub fn start(&self, ids: &ServoIdList) -> Result<(), DriverError> {
        let mut thread = self.thread.lock();
        if self.shared.running.load(Ordering::Acquire) {
            debug!("Control loop already running");
            return Ok(());
        }
        self.shared.lanes.lock().assign(ids);
        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        match thread::Builder::new()
            .name("servo-control".into())
            .spawn(move || run_loop(shared))
        {
            Ok(handle) => {
                *thread = Some(handle);
                info!(
                    dynamixel = ids.dynamixel.len(),
                    openservo = ids.openservo.len(),
                    "Control loop starting"
                );
                Ok(())
            },
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(DriverError::LoopThread(e.to_string()))
            },
        }
    }

    /// 停止后台线程并等待其退出，然后执行队列中剩余的命令
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let handle = self.thread.lock().take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            warn!("stop() called from the control thread, not joining");
            return;
        }
        if handle.join_timeout(STOP_TIMEOUT).is_err() {
            error!(
                "Control thread panicked or failed to shut down within {:?}",
                STOP_TIMEOUT
            );
        }
        self.shared.drain();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// 入队命令；循环停止时在当前线程上同步执行整个队列
    pub fn enqueue(&self, command: PendingCommand) {
        self.shared.queue.push(command);
        if !self.is_running() {
            self.shared.drain();
        }
    }

    /// 手动执行一个周期（循环未运行时用于单步驱动）
    pub fn run_cycle(&self) {
        self.shared.step();
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.shared.settings
    }

    pub fn switches(&self) -> &LoopSwitches {
        &self.shared.switches
    }

    pub fn metrics(&self) -> &LoopMetrics {
        &self.shared.metrics
    }
}

impl Drop for ControlLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
