//! 驱动层模块
//!
//! 本模块提供串口舵机总线的控制功能，包括：
//! - 控制线程（命令 → 移动 → 反馈读取的固定周期）
//! - 并发状态缓存（两级合并，ArcSwap 无锁读取）
//! - 多生产者命令队列（阻塞等待或回调）
//! - 过热保护（带回差的自动关闭/开启）
//! - 移动速度规划
//!
//! # 使用场景
//!
//! 运动层通过 `submit_goals` / `move_servos` 提交目标，遥测通过
//! `read_cached_feedback` 读取反馈；只有控制线程访问串口。

mod builder;
pub mod cache;
pub mod command;
pub mod control_loop;
mod controller;
mod error;
pub mod family;
pub mod metrics;
pub mod mover;
pub mod settings;
pub mod state;
pub mod temperature;

pub use builder::ControllerBuilder;
pub use cache::{BatchView, ConcurrentServoCache, SubmitOutcome};
pub use command::{CommandQueue, CompletionHandle, PendingCommand, ResponseCallback};
pub use control_loop::{ControlLoop, ServoIdList, read_packets};
pub use controller::{DEFAULT_COMMAND_TIMEOUT, ServoController};
pub use error::DriverError;
pub use family::{Dynamixel, OpenServo, ServoFamily};
pub use metrics::{LoopMetrics, MetricsSnapshot};
pub use settings::{ControlSettings, LoopSwitches};
pub use state::{DEFAULT_COMMAND_DELAY, FeedbackSnapshot, GoalSnapshot, ServoCacheEntry, ServoId};
pub use temperature::TemperatureMonitor;
