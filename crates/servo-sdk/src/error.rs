//! SDK 错误类型

use servo_driver::DriverError;
use servo_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SdkError {
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 读取配置文件失败
    #[error("Failed to read config file {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// 配置内容不一致
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}
