//! 驱动层错误类型定义

use servo_protocol::ProtocolError;
use servo_serial::SerialError;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 串口传输错误
    #[error("Serial transport error: {0}")]
    Serial(#[from] SerialError),

    /// 协议编解码错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 等待命令响应超时
    #[error("Operation timeout")]
    Timeout,

    /// 命令已发出但没有收到可用响应（发送失败或响应丢失）
    #[error("No response from servo")]
    NoResponse,

    /// 舵机返回了错误状态
    #[error("Servo {servo} reported error status 0x{status:02X}")]
    ServoStatus { servo: String, status: u8 },

    /// 控制线程错误
    #[error("Control loop thread error: {0}")]
    LoopThread(String),

    /// 无效输入
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

#[cfg(test)]
mod tests {
    use super::DriverError;
    use servo_protocol::ProtocolError;
    use servo_serial::SerialError;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::from(SerialError::Timeout);
        assert_eq!(err.to_string(), "Serial transport error: Read timeout");

        let err = DriverError::from(ProtocolError::InvalidServoId(254));
        assert!(err.to_string().contains("Invalid servo id: 254"));

        let err = DriverError::ServoStatus {
            servo: "5".into(),
            status: 0x04,
        };
        assert_eq!(err.to_string(), "Servo 5 reported error status 0x04");
    }

    #[test]
    fn test_driver_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DriverError>();
    }
}
