//! 控制循环参数
//!
//! `ControlSettings` 在构造控制器时确定；`LoopSwitches` 是运行期可切换的
//! 原子开关（move / command / update），控制线程每个周期读取一次。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// 控制循环参数
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ControlSettings {
    /// 每次批量读取反馈的舵机数量
    pub read_count: usize,
    /// 舵机响应延迟寄存器值（ReturnDelay，单位 2us）
    pub return_delay: u8,
    /// 超过该温度（摄氏度）的舵机会被关闭力矩
    pub max_run_temperature: u16,
    /// 温度回落到该值以下后重新启用
    pub cooldown_temperature: u16,
    /// 从发出移动命令到舵机开始执行的估计延迟（毫秒）
    pub command_send_delay_ms: u64,
    /// 单个响应包的读取超时（毫秒）
    pub timeout_ms: u64,
    /// 初始是否允许移动
    pub move_enabled: bool,
    /// 初始是否处理命令队列
    pub command_enabled: bool,
    /// 初始是否读取反馈
    pub update_enabled: bool,
    /// OpenServo 每隔多少轮读一次反馈
    pub openservo_read_divider: u32,
    /// 周期出错后的退避时间（毫秒）
    pub error_backoff_ms: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            read_count: 1,
            return_delay: 0,
            max_run_temperature: 77,
            cooldown_temperature: 69,
            command_send_delay_ms: 0,
            timeout_ms: 30,
            move_enabled: true,
            command_enabled: true,
            update_enabled: true,
            openservo_read_divider: 10,
            error_backoff_ms: 5,
        }
    }
}

impl ControlSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn command_send_delay(&self) -> Duration {
        Duration::from_millis(self.command_send_delay_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// 检查参数的一致性
    pub fn validate(&self) -> Result<(), String> {
        if self.read_count == 0 {
            return Err("read_count must be at least 1".into());
        }
        if self.cooldown_temperature > self.max_run_temperature {
            return Err(format!(
                "cooldown_temperature ({}) must not exceed max_run_temperature ({})",
                self.cooldown_temperature, self.max_run_temperature
            ));
        }
        if self.openservo_read_divider == 0 {
            return Err("openservo_read_divider must be at least 1".into());
        }
        Ok(())
    }
}

/// 运行期开关
#[derive(Debug)]
pub struct LoopSwitches {
    move_enabled: AtomicBool,
    command_enabled: AtomicBool,
    update_enabled: AtomicBool,
}

impl LoopSwitches {
    pub fn new(settings: &ControlSettings) -> Self {
        Self {
            move_enabled: AtomicBool::new(settings.move_enabled),
            command_enabled: AtomicBool::new(settings.command_enabled),
            update_enabled: AtomicBool::new(settings.update_enabled),
        }
    }

    pub fn move_enabled(&self) -> bool {
        self.move_enabled.load(Ordering::Acquire)
    }

    pub fn command_enabled(&self) -> bool {
        self.command_enabled.load(Ordering::Acquire)
    }

    pub fn update_enabled(&self) -> bool {
        self.update_enabled.load(Ordering::Acquire)
    }

    pub fn set_move_enabled(&self, enabled: bool) {
        self.move_enabled.store(enabled, Ordering::Release);
    }

    pub fn set_command_enabled(&self, enabled: bool) {
        self.command_enabled.store(enabled, Ordering::Release);
    }

    pub fn set_update_enabled(&self, enabled: bool) {
        self.update_enabled.store(enabled, Ordering::Release);
    }
}
