//! 移动速度规划（寄存器寻址舵机）
//!
//! 根据最近一次反馈估计舵机当前位置，再计算在目标时间到达所需的速度。
//! 单位换算基于 RX 系列：位置 0..1023 对应 300 度，速度 1 单位约 0.111 rpm。

use crate::settings::ControlSettings;
use crate::state::{ServoCacheEntry, ServoId};
use std::time::Instant;

const RX_MAX_POSITION: f64 = 1023.0;
const RX_ROTATION_RANGE: f64 = 300.0;
const RX_RPM_PER_UNIT: f64 = 0.111;

/// 最小速度（0 在硬件上表示"不限速"，因此最小取 1）
pub const MIN_SPEED: u16 = 1;
/// 最大速度
pub const MAX_SPEED: u16 = 1023;

/// 以 `speed`（带方向）运行 `elapsed_ms` 毫秒走过的位置单位数
pub fn distance(speed: i32, elapsed_ms: i64) -> i32 {
    let speed = speed.clamp(-(MAX_SPEED as i32), MAX_SPEED as i32);
    let time = elapsed_ms.max(1) as f64;
    let rpm = speed as f64 * RX_RPM_PER_UNIT;
    let degrees = (rpm * 360.0) / (60000.0 / time);
    ((degrees / RX_ROTATION_RANGE) * RX_MAX_POSITION) as i32
}

/// 在 `time_ms` 毫秒内从 `current` 到达 `goal` 所需的速度
pub fn plan_speed(current: i32, goal: i32, time_ms: i64) -> u16 {
    let dist = (goal as i64 - current as i64).abs() as f64;
    let degrees = dist * RX_ROTATION_RANGE / RX_MAX_POSITION;
    let time = time_ms.max(1) as f64;
    let rpm = degrees * (60000.0 / time) / 360.0;
    let speed = rpm / RX_RPM_PER_UNIT;
    (speed as i64).clamp(MIN_SPEED as i64, MAX_SPEED as i64) as u16
}

fn millis_between(later: Instant, earlier: Instant) -> i64 {
    match later.checked_duration_since(earlier) {
        Some(d) => d.as_millis() as i64,
        None => -(earlier.duration_since(later).as_millis() as i64),
    }
}

/// 估计命令到达舵机时的位置，不越过上一次发送的目标
pub fn estimate_position<Id: ServoId>(entry: &ServoCacheEntry<Id>, now: Instant) -> i32 {
    let feedback = entry.feedback();
    let arrival = now + entry.command_delay();
    let elapsed = millis_between(arrival, feedback.updated_at);
    let current = feedback.position as i32;
    let estimate = current.saturating_add(distance(feedback.speed, elapsed));

    match entry.previous_goal() {
        Some(prev) => {
            let prev = prev.goal_position as i32;
            if current < prev {
                estimate.min(prev)
            } else {
                estimate.max(prev)
            }
        },
        None => estimate,
    }
}

/// 计算条目当前目标的移动速度；没有目标时返回 `None`
pub fn plan_entry_speed<Id: ServoId>(
    entry: &ServoCacheEntry<Id>,
    now: Instant,
    settings: &ControlSettings,
) -> Option<u16> {
    let goal = entry.goal()?;
    let current = estimate_position(entry, now);
    let time = millis_between(goal.target_time, now) - settings.command_send_delay_ms as i64;
    Some(plan_speed(current, goal.goal_position as i32, time))
}
