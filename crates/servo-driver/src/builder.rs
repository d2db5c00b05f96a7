//! Builder 模式实现
//!
//! 提供链式构造 `ServoController` 的便捷方式。

use crate::controller::{DEFAULT_COMMAND_TIMEOUT, ServoController};
use crate::error::DriverError;
use crate::settings::ControlSettings;
use servo_serial::{SerialConfig, Transport};
use std::time::Duration;

/// ServoController Builder（链式构造）
///
/// # Example
///
/// ```no_run
/// use servo_driver::{ControlSettings, ControllerBuilder};
///
/// let controller = ControllerBuilder::new()
///     .port("/dev/ttyUSB0")
///     .baud_rate(1_000_000)
///     .settings(ControlSettings {
///         max_run_temperature: 70,
///         ..ControlSettings::default()
///     })
///     .build()
///     .unwrap();
/// ```
pub struct ControllerBuilder {
    serial: SerialConfig,
    settings: ControlSettings,
    command_timeout: Duration,
    /// 显式指定的传输（优先于串口参数）
    transport: Option<Box<dyn Transport>>,
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self {
            serial: SerialConfig::default(),
            settings: ControlSettings::default(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            transport: None,
        }
    }

    /// 串口设备路径
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.serial.port = port.into();
        self
    }

    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.serial.baud_rate = baud_rate;
        self
    }

    pub fn serial_config(mut self, config: SerialConfig) -> Self {
        self.serial = config;
        self
    }

    pub fn settings(mut self, settings: ControlSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 阻塞式命令的等待时间
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// 使用自定义传输（如测试用的 Mock）
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 构建控制器（控制循环未启动）
    pub fn build(self) -> Result<ServoController, DriverError> {
        self.settings
            .validate()
            .map_err(DriverError::InvalidInput)?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => open_serial(&self.serial)?,
        };
        Ok(ServoController::new(transport, self.settings)
            .with_command_timeout(self.command_timeout))
    }
}

#[cfg(feature = "serialport")]
fn open_serial(config: &SerialConfig) -> Result<Box<dyn Transport>, DriverError> {
    let port = servo_serial::SerialPortTransport::open(config)?;
    Ok(Box::new(port))
}

#[cfg(not(feature = "serialport"))]
fn open_serial(config: &SerialConfig) -> Result<Box<dyn Transport>, DriverError> {
    Err(DriverError::InvalidInput(format!(
        "no transport given and serial port support is disabled (port {})",
        config.port
    )))
}
