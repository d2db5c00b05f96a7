//! 控制器配置文件
//!
//! ```toml
//! dynamixel_ids = [1, 2, 3]
//! command_timeout_ms = 20000
//!
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 1000000
//!
//! [settings]
//! max_run_temperature = 75
//!
//! [[openservo]]
//! rs485 = 1
//! i2c = 16
//! ```
//!
//! 所有字段都有默认值，可以省略。

use crate::error::SdkError;
use serde::{Deserialize, Serialize};
use servo_driver::{ControlSettings, ControllerBuilder, DEFAULT_COMMAND_TIMEOUT, ServoIdList};
use servo_protocol::dynamixel::DynamixelId;
use servo_protocol::openservo::OpenServoId;
use servo_serial::SerialConfig;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// 寄存器寻址舵机 id
    pub dynamixel_ids: Vec<DynamixelId>,
    /// 阻塞式命令的等待时间（毫秒）
    pub command_timeout_ms: u64,
    pub serial: SerialConfig,
    pub settings: ControlSettings,
    /// 总线寻址舵机地址
    pub openservo: Vec<OpenServoId>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            dynamixel_ids: Vec::new(),
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            serial: SerialConfig::default(),
            settings: ControlSettings::default(),
            openservo: Vec::new(),
        }
    }
}

impl ControllerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, SdkError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SdkError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| SdkError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded controller config");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, SdkError> {
        Ok(toml::to_string(self)?)
    }

    /// 检查参数和舵机地址
    pub fn validate(&self) -> Result<(), SdkError> {
        self.settings.validate().map_err(SdkError::InvalidConfig)?;

        let mut seen = HashSet::new();
        for id in &self.dynamixel_ids {
            if !seen.insert(*id) {
                return Err(SdkError::InvalidConfig(format!("duplicate servo id {id}")));
            }
        }
        for id in &self.openservo {
            // 反序列化不经过构造函数，这里重新检查地址范围
            OpenServoId::new(id.rs485(), id.i2c())?;
        }
        Ok(())
    }

    pub fn servo_ids(&self) -> ServoIdList {
        ServoIdList::new(self.dynamixel_ids.clone(), self.openservo.clone())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// 按配置预设的 Builder（未指定传输时打开串口）
    pub fn builder(&self) -> ControllerBuilder {
        ControllerBuilder::new()
            .serial_config(self.serial.clone())
            .settings(self.settings.clone())
            .command_timeout(self.command_timeout())
    }
}
