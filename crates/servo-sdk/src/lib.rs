//! Servo SDK - 串口总线舵机控制 Rust SDK
//!
//! # 架构设计
//!
//! 本 SDK 采用分层架构，从底层到高层：
//!
//! - **协议层** (`protocol`): 两个舵机族的报文编解码，无 IO
//! - **传输层** (`serial`): 半双工串口抽象，真实串口与测试用 Mock
//! - **驱动层** (`driver`): 控制线程、并发状态缓存、命令队列、过热保护
//!
//! 本 crate 额外提供日志初始化、TOML 配置文件和 `connect` 入口。
//!
//! # 快速开始
//!
//! ```no_run
//! use servo_sdk::prelude::*;
//! use std::time::Duration;
//!
//! servo_sdk::init_logger();
//! let config = ControllerConfig::from_file("servos.toml").unwrap();
//! let controller = servo_sdk::connect(&config).unwrap();
//!
//! let id = DynamixelId::new(1).unwrap();
//! controller.set_goal_position(id, 512);
//! controller.move_servos(&[id], Duration::from_millis(500));
//! ```

mod config;
mod error;
pub mod prelude;

pub use servo_driver as driver;
pub use servo_protocol as protocol;
pub use servo_serial as serial;

pub use config::ControllerConfig;
pub use error::SdkError;

pub use servo_driver::{
    ControlSettings, ControllerBuilder, DriverError, FeedbackSnapshot, GoalSnapshot,
    MetricsSnapshot, ServoController, ServoIdList,
};
pub use servo_protocol::ProtocolError;
pub use servo_protocol::dynamixel::DynamixelId;
pub use servo_protocol::openservo::OpenServoId;
pub use servo_serial::{SerialConfig, SerialError, Transport};

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// 初始化日志
///
/// 安装 `tracing-subscriber` 的 fmt 输出，级别由 `RUST_LOG` 控制（默认 `info`），
/// 并把 `log` 门面的记录转发到 `tracing`。重复调用无副作用；
/// 如果进程里已经安装了全局 subscriber，则保持原状。
pub fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
        if tracing::subscriber::set_global_default(subscriber).is_ok() {
            let _ = tracing_log::LogTracer::builder()
                .with_max_level(log::LevelFilter::Trace)
                .init();
        }
    });
}

/// 按配置打开串口、探测舵机并启动控制循环
pub fn connect(config: &ControllerConfig) -> Result<ServoController, SdkError> {
    config.validate()?;
    let controller = config.builder().build()?;
    start(controller, config)
}

/// 与 `connect` 相同，但使用给定的传输
pub fn connect_with_transport(
    config: &ControllerConfig,
    transport: Box<dyn Transport>,
) -> Result<ServoController, SdkError> {
    config.validate()?;
    let controller = config.builder().transport(transport).build()?;
    start(controller, config)
}

fn start(
    controller: ServoController,
    config: &ControllerConfig,
) -> Result<ServoController, SdkError> {
    let active = controller.connect(&config.servo_ids())?;
    tracing::info!(
        port = %config.serial.port,
        dynamixel = active.dynamixel.len(),
        openservo = active.openservo.len(),
        "Servo controller connected"
    );
    Ok(controller)
}
