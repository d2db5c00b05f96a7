//! 状态值类型
//!
//! - `FeedbackSnapshot`: 从硬件读回的反馈（不可变）
//! - `GoalSnapshot`: 运动层给出的目标（不可变）
//! - `ServoCacheEntry`: 每个舵机的合并条目，只由 `ConcurrentServoCache` 持有和修改

use servo_protocol::dynamixel::DynamixelId;
use servo_protocol::openservo::OpenServoId;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// 舵机 id 的公共约束
pub trait ServoId: Copy + Eq + Hash + Ord + Debug + Display + Send + Sync + 'static {}

impl ServoId for DynamixelId {}
impl ServoId for OpenServoId {}

/// 默认命令延迟估计
pub const DEFAULT_COMMAND_DELAY: Duration = Duration::from_millis(2);

/// 硬件反馈快照
///
/// `temperature == 0 && voltage == 0` 表示"尚未读到"（哨兵值），
/// 不参与合并，也不参与移动决策。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackSnapshot<Id> {
    pub servo_id: Id,
    pub position: u16,
    pub speed: i32,
    pub load: i32,
    pub voltage: u16,
    pub temperature: u16,
    pub updated_at: Instant,
}

impl<Id> FeedbackSnapshot<Id> {
    /// 哨兵快照
    pub fn sentinel(servo_id: Id) -> Self {
        Self {
            servo_id,
            position: 0,
            speed: 0,
            load: 0,
            voltage: 0,
            temperature: 0,
            updated_at: Instant::now(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.temperature == 0 && self.voltage == 0
    }
}

/// 运动目标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoalSnapshot<Id> {
    pub servo_id: Id,
    /// 绝对位置（硬件单位）
    pub goal_position: u16,
    /// 期望到达时间
    pub target_time: Instant,
}

impl<Id> GoalSnapshot<Id> {
    pub fn new(servo_id: Id, goal_position: u16, target_time: Instant) -> Self {
        Self {
            servo_id,
            goal_position,
            target_time,
        }
    }

    /// 在 `duration` 之后到达
    pub fn in_duration(servo_id: Id, goal_position: u16, duration: Duration) -> Self {
        Self::new(servo_id, goal_position, Instant::now() + duration)
    }
}

/// 单个舵机的缓存条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServoCacheEntry<Id> {
    servo_id: Id,
    feedback: FeedbackSnapshot<Id>,
    goal: Option<GoalSnapshot<Id>>,
    previous_goal: Option<GoalSnapshot<Id>>,
    command_delay: Duration,
}

impl<Id: ServoId> ServoCacheEntry<Id> {
    /// 由首个反馈创建（无目标）
    pub(crate) fn from_feedback(feedback: FeedbackSnapshot<Id>) -> Self {
        Self {
            servo_id: feedback.servo_id,
            feedback,
            goal: None,
            previous_goal: None,
            command_delay: DEFAULT_COMMAND_DELAY,
        }
    }

    /// 由首个目标创建（反馈为哨兵值）
    pub(crate) fn from_goal(goal: GoalSnapshot<Id>) -> Self {
        Self {
            servo_id: goal.servo_id,
            feedback: FeedbackSnapshot::sentinel(goal.servo_id),
            goal: Some(goal),
            previous_goal: None,
            command_delay: DEFAULT_COMMAND_DELAY,
        }
    }

    pub fn servo_id(&self) -> Id {
        self.servo_id
    }

    pub fn feedback(&self) -> &FeedbackSnapshot<Id> {
        &self.feedback
    }

    pub fn goal(&self) -> Option<&GoalSnapshot<Id>> {
        self.goal.as_ref()
    }

    pub fn previous_goal(&self) -> Option<&GoalSnapshot<Id>> {
        self.previous_goal.as_ref()
    }

    pub fn command_delay(&self) -> Duration {
        self.command_delay
    }

    pub fn set_command_delay(&mut self, delay: Duration) {
        self.command_delay = delay;
    }

    /// 有尚未发送的目标
    pub fn has_due_goal(&self) -> bool {
        self.goal.is_some() && self.goal != self.previous_goal
    }

    /// 合并反馈；哨兵值和其他 id 的快照被忽略
    pub(crate) fn merge_feedback(&mut self, feedback: FeedbackSnapshot<Id>) -> bool {
        if feedback.is_sentinel() || feedback.servo_id != self.servo_id {
            return false;
        }
        self.feedback = feedback;
        true
    }

    /// 合并目标；其他 id 的目标被忽略
    pub(crate) fn merge_goal(&mut self, goal: GoalSnapshot<Id>) -> bool {
        if goal.servo_id != self.servo_id {
            return false;
        }
        self.goal = Some(goal);
        true
    }

    /// 确认当前目标已发送
    pub fn goals_sent(&mut self) {
        self.previous_goal = self.goal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u8) -> DynamixelId {
        DynamixelId::new(v).unwrap()
    }

    fn feedback(servo: u8, temperature: u16, voltage: u16) -> FeedbackSnapshot<DynamixelId> {
        FeedbackSnapshot {
            servo_id: id(servo),
            position: 512,
            speed: 0,
            load: 0,
            voltage,
            temperature,
            updated_at: Instant::now(),
        }
    }

    #[test]
    fn test_sentinel_detection() {
        assert!(FeedbackSnapshot::sentinel(id(1)).is_sentinel());
        assert!(!feedback(1, 40, 0).is_sentinel());
        assert!(!feedback(1, 0, 120).is_sentinel());
    }

    #[test]
    fn test_entry_from_goal_seeds_sentinel() {
        let goal = GoalSnapshot::in_duration(id(3), 700, Duration::from_millis(100));
        let entry = ServoCacheEntry::from_goal(goal);
        assert!(entry.feedback().is_sentinel());
        assert_eq!(entry.goal(), Some(&goal));
        assert!(entry.has_due_goal());
        assert_eq!(entry.command_delay(), DEFAULT_COMMAND_DELAY);
    }

    #[test]
    fn test_entry_rejects_sentinel_and_foreign_id() {
        let mut entry = ServoCacheEntry::from_feedback(feedback(1, 40, 120));
        assert!(!entry.merge_feedback(FeedbackSnapshot::sentinel(id(1))));
        assert!(!entry.merge_feedback(feedback(2, 50, 121)));
        assert_eq!(entry.feedback().temperature, 40);

        let foreign = GoalSnapshot::in_duration(id(2), 10, Duration::ZERO);
        assert!(!entry.merge_goal(foreign));
        assert!(entry.goal().is_none());
    }

    #[test]
    fn test_goals_sent_clears_due() {
        let mut entry = ServoCacheEntry::from_feedback(feedback(1, 40, 120));
        assert!(!entry.has_due_goal());

        let goal = GoalSnapshot::in_duration(id(1), 300, Duration::from_millis(50));
        entry.merge_goal(goal);
        assert!(entry.has_due_goal());

        entry.goals_sent();
        assert!(!entry.has_due_goal());
        assert_eq!(entry.previous_goal(), Some(&goal));

        let next = GoalSnapshot::in_duration(id(1), 310, Duration::from_millis(60));
        entry.merge_goal(next);
        assert!(entry.has_due_goal());
    }
}
