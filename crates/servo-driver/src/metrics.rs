//! 控制循环指标
//!
//! 原子计数器，可在任何线程读取，不引入锁竞争。

use std::sync::atomic::{AtomicU64, Ordering};

/// 控制循环实时指标
#[derive(Debug, Default)]
pub struct LoopMetrics {
    /// 已执行的周期数
    pub cycles: AtomicU64,
    /// 成功发出的命令数
    pub commands_sent: AtomicU64,
    /// 发送失败或响应不足的命令数
    pub command_failures: AtomicU64,
    /// 成功发出的批量移动
    pub moves: AtomicU64,
    /// 发送失败的批量移动
    pub move_failures: AtomicU64,
    /// 反馈读取次数
    pub reads: AtomicU64,
    /// 读取失败或不完整的次数
    pub read_failures: AtomicU64,
    /// 因过热被关闭的舵机次数
    pub servos_disabled: AtomicU64,
    /// 周期内捕获的错误/panic 次数
    pub cycle_errors: AtomicU64,
}

impl LoopMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取指标快照
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
            moves: self.moves.load(Ordering::Relaxed),
            move_failures: self.move_failures.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            servos_disabled: self.servos_disabled.load(Ordering::Relaxed),
            cycle_errors: self.cycle_errors.load(Ordering::Relaxed),
        }
    }

    /// 重置所有计数器
    pub fn reset(&self) {
        self.cycles.store(0, Ordering::Relaxed);
        self.commands_sent.store(0, Ordering::Relaxed);
        self.command_failures.store(0, Ordering::Relaxed);
        self.moves.store(0, Ordering::Relaxed);
        self.move_failures.store(0, Ordering::Relaxed);
        self.reads.store(0, Ordering::Relaxed);
        self.read_failures.store(0, Ordering::Relaxed);
        self.servos_disabled.store(0, Ordering::Relaxed);
        self.cycle_errors.store(0, Ordering::Relaxed);
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub cycles: u64,
    pub commands_sent: u64,
    pub command_failures: u64,
    pub moves: u64,
    pub move_failures: u64,
    pub reads: u64,
    pub read_failures: u64,
    pub servos_disabled: u64,
    pub cycle_errors: u64,
}

impl MetricsSnapshot {
    /// 读取失败率（无读取时为 0）
    pub fn read_failure_rate(&self) -> f64 {
        if self.reads == 0 {
            return 0.0;
        }
        self.read_failures as f64 / self.reads as f64
    }
}
