//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use servo_sdk::prelude::*;
//! ```

pub use crate::{ControllerConfig, SdkError};

pub use servo_driver::{
    ControlSettings, ControllerBuilder, DriverError, FeedbackSnapshot, GoalSnapshot,
    ServoController, ServoIdList,
};
pub use servo_protocol::dynamixel::{DynamixelId, Register};
pub use servo_protocol::openservo::OpenServoId;
pub use servo_serial::{SerialConfig, Transport};
