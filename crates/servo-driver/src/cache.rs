//! 并发状态缓存
//!
//! 每个舵机一个 `ServoCacheEntry`，由一把互斥锁保护。
//!
//! # 两级合并
//!
//! - `submit_feedback` / `submit_goals` 先 `try_lock`：拿到锁就立即合并
//! - 拿不到锁（控制线程正持有 `BatchView` 发送移动命令）时，
//!   按舵机 id 放入待合并队列，同一 id 后写覆盖先写
//! - 任何持锁者在释放主锁之前都会把待合并队列清空（先反馈，后目标）
//!
//! 锁顺序：提交方持有 `pending` 时只对 `entries` 做 `try_lock`；
//! 释放方持有 `entries` 再阻塞获取 `pending`，并且先释放 `entries`
//! 再释放 `pending`。因此进入队列的更新一定会被某个持锁者合并。
//!
//! # 无锁读取
//!
//! 每次反馈变化后，非哨兵反馈表通过 `ArcSwap` 发布，
//! `read_cached_feedback` 不会与控制线程竞争锁。

use crate::state::{FeedbackSnapshot, GoalSnapshot, ServoCacheEntry, ServoId};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

type EntryMap<Id> = HashMap<Id, ServoCacheEntry<Id>>;

/// 提交结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// 已立即合并
    Merged,
    /// 缓存被占用，已排队，释放时合并
    Queued,
}

enum Update<Id> {
    Feedback(Vec<FeedbackSnapshot<Id>>),
    Goals(Vec<GoalSnapshot<Id>>),
}

struct PendingUpdates<Id> {
    feedback: HashMap<Id, FeedbackSnapshot<Id>>,
    goals: HashMap<Id, GoalSnapshot<Id>>,
}

impl<Id: ServoId> PendingUpdates<Id> {
    fn new() -> Self {
        Self {
            feedback: HashMap::new(),
            goals: HashMap::new(),
        }
    }

    fn queue(&mut self, update: Update<Id>) {
        match update {
            Update::Feedback(batch) => {
                for snapshot in batch {
                    self.feedback.insert(snapshot.servo_id, snapshot);
                }
            },
            Update::Goals(batch) => {
                for goal in batch {
                    self.goals.insert(goal.servo_id, goal);
                }
            },
        }
    }

    fn len(&self) -> usize {
        self.feedback.len() + self.goals.len()
    }
}

/// 并发状态缓存
pub struct ConcurrentServoCache<Id: ServoId> {
    entries: Mutex<EntryMap<Id>>,
    pending: Mutex<PendingUpdates<Id>>,
    move_pending: AtomicBool,
    published: ArcSwap<HashMap<Id, FeedbackSnapshot<Id>>>,
    disabled: RwLock<HashSet<Id>>,
}

impl<Id: ServoId> Default for ConcurrentServoCache<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: ServoId> ConcurrentServoCache<Id> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingUpdates::new()),
            move_pending: AtomicBool::new(false),
            published: ArcSwap::from_pointee(HashMap::new()),
            disabled: RwLock::new(HashSet::new()),
        }
    }

    /// 提交一批反馈（哨兵值直接丢弃）
    pub fn submit_feedback<I>(&self, batch: I) -> SubmitOutcome
    where
        I: IntoIterator<Item = FeedbackSnapshot<Id>>,
    {
        let batch: Vec<_> = batch.into_iter().filter(|f| !f.is_sentinel()).collect();
        if batch.is_empty() {
            return SubmitOutcome::Merged;
        }
        self.submit(Update::Feedback(batch))
    }

    /// 提交一批目标
    pub fn submit_goals<I>(&self, batch: I) -> SubmitOutcome
    where
        I: IntoIterator<Item = GoalSnapshot<Id>>,
    {
        let batch: Vec<_> = batch.into_iter().collect();
        if batch.is_empty() {
            return SubmitOutcome::Merged;
        }
        self.submit(Update::Goals(batch))
    }

    fn submit(&self, update: Update<Id>) -> SubmitOutcome {
        if let Some(mut entries) = self.entries.try_lock() {
            let changed = self.apply(&mut entries, update);
            let pending = self.pending.lock();
            self.finish(entries, pending, changed);
            return SubmitOutcome::Merged;
        }

        let mut pending = self.pending.lock();
        // 持有者可能刚刚释放；重试一次，避免更新滞留在队列里
        if let Some(mut entries) = self.entries.try_lock() {
            let changed = self.apply(&mut entries, update);
            self.finish(entries, pending, changed);
            return SubmitOutcome::Merged;
        }
        pending.queue(update);
        trace!(queued = pending.len(), "Cache busy, update queued");
        SubmitOutcome::Queued
    }

    fn apply(&self, entries: &mut EntryMap<Id>, update: Update<Id>) -> bool {
        match update {
            Update::Feedback(batch) => self.merge_feedback_into(entries, batch),
            Update::Goals(batch) => {
                self.merge_goals_into(entries, batch);
                false
            },
        }
    }

    /// 合并反馈，返回是否有条目变化
    fn merge_feedback_into<I>(&self, entries: &mut EntryMap<Id>, batch: I) -> bool
    where
        I: IntoIterator<Item = FeedbackSnapshot<Id>>,
    {
        let mut changed = false;
        for snapshot in batch {
            if snapshot.is_sentinel() {
                continue;
            }
            changed |= match entries.entry(snapshot.servo_id) {
                Entry::Occupied(mut e) => e.get_mut().merge_feedback(snapshot),
                Entry::Vacant(v) => {
                    v.insert(ServoCacheEntry::from_feedback(snapshot));
                    true
                },
            };
        }
        changed
    }

    fn merge_goals_into<I>(&self, entries: &mut EntryMap<Id>, batch: I)
    where
        I: IntoIterator<Item = GoalSnapshot<Id>>,
    {
        let mut merged = false;
        for goal in batch {
            match entries.entry(goal.servo_id) {
                Entry::Occupied(mut e) => {
                    e.get_mut().merge_goal(goal);
                },
                Entry::Vacant(v) => {
                    v.insert(ServoCacheEntry::from_goal(goal));
                },
            }
            merged = true;
        }
        if merged {
            self.move_pending.store(true, Ordering::Release);
        }
    }

    /// 清空待合并队列、发布反馈表，然后先释放主锁再释放队列锁
    fn finish(
        &self,
        mut entries: MutexGuard<'_, EntryMap<Id>>,
        mut pending: MutexGuard<'_, PendingUpdates<Id>>,
        mut changed: bool,
    ) {
        if !pending.feedback.is_empty() {
            let feedback = std::mem::take(&mut pending.feedback);
            changed |= self.merge_feedback_into(&mut entries, feedback.into_values());
        }
        if !pending.goals.is_empty() {
            let goals = std::mem::take(&mut pending.goals);
            self.merge_goals_into(&mut entries, goals.into_values());
        }
        if changed {
            self.publish(&entries);
        }
        drop(entries);
        drop(pending);
    }

    fn publish(&self, entries: &EntryMap<Id>) {
        let table: HashMap<_, _> = entries
            .iter()
            .filter(|(_, e)| !e.feedback().is_sentinel())
            .map(|(id, e)| (*id, *e.feedback()))
            .collect();
        self.published.store(Arc::new(table));
    }

    /// 获取批量视图（阻塞）
    ///
    /// 视图被 drop 时合并期间排队的更新。
    pub fn acquire_batch_view(&self) -> BatchView<'_, Id> {
        BatchView {
            cache: self,
            entries: Some(self.entries.lock()),
        }
    }

    /// 是否有未发送的目标
    pub fn move_pending(&self) -> bool {
        self.move_pending.load(Ordering::Acquire)
    }

    /// 最近一次合并的反馈（无锁）
    pub fn read_cached_feedback(&self, id: Id) -> Option<FeedbackSnapshot<Id>> {
        self.published.load().get(&id).copied()
    }

    /// 当前发布的全部反馈（无锁）
    pub fn feedback_table(&self) -> Arc<HashMap<Id, FeedbackSnapshot<Id>>> {
        self.published.load_full()
    }

    /// 条目副本（阻塞）
    pub fn entry(&self, id: Id) -> Option<ServoCacheEntry<Id>> {
        self.entries.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 排队中的更新数量
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// 标记舵机是否参与移动（过热或手动关闭力矩时为 false）
    pub fn set_enabled(&self, id: Id, enabled: bool) {
        let mut disabled = self.disabled.write();
        if enabled {
            disabled.remove(&id);
        } else {
            disabled.insert(id);
        }
    }

    pub fn is_enabled(&self, id: Id) -> bool {
        !self.disabled.read().contains(&id)
    }
}

/// 批量视图：控制线程在移动阶段独占缓存
pub struct BatchView<'a, Id: ServoId> {
    cache: &'a ConcurrentServoCache<Id>,
    entries: Option<MutexGuard<'a, EntryMap<Id>>>,
}

impl<Id: ServoId> BatchView<'_, Id> {
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |e| e.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: Id) -> Option<&ServoCacheEntry<Id>> {
        self.entries.as_ref().and_then(|e| e.get(&id))
    }

    pub fn get_mut(&mut self, id: Id) -> Option<&mut ServoCacheEntry<Id>> {
        self.entries.as_mut().and_then(|e| e.get_mut(&id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServoCacheEntry<Id>> {
        self.entries.iter().flat_map(|e| e.values())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServoCacheEntry<Id>> {
        self.entries.iter_mut().flat_map(|e| e.values_mut())
    }

    /// 在视图内合并反馈
    pub fn merge_feedback<I>(&mut self, batch: I) -> bool
    where
        I: IntoIterator<Item = FeedbackSnapshot<Id>>,
    {
        match self.entries.as_mut() {
            Some(entries) => {
                let changed = self.cache.merge_feedback_into(entries, batch);
                if changed {
                    self.cache.publish(entries);
                }
                changed
            },
            None => false,
        }
    }

    /// 在视图内合并目标
    pub fn merge_goals<I>(&mut self, batch: I)
    where
        I: IntoIterator<Item = GoalSnapshot<Id>>,
    {
        if let Some(entries) = self.entries.as_mut() {
            self.cache.merge_goals_into(entries, batch);
        }
    }

    pub fn move_pending(&self) -> bool {
        self.cache.move_pending()
    }

    /// 移动发送成功后清除标志（仍持有视图时调用）
    pub fn clear_move_pending(&self) {
        self.cache.move_pending.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self, id: Id) -> bool {
        self.cache.is_enabled(id)
    }
}

impl<Id: ServoId> Drop for BatchView<'_, Id> {
    fn drop(&mut self) {
        if let Some(entries) = self.entries.take() {
            let pending = self.cache.pending.lock();
            self.cache.finish(entries, pending, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use servo_protocol::dynamixel::DynamixelId;
    use std::time::{Duration, Instant};

    fn id(v: u8) -> DynamixelId {
        DynamixelId::new(v).unwrap()
    }

    fn feedback(servo: u8, position: u16, temperature: u16) -> FeedbackSnapshot<DynamixelId> {
        FeedbackSnapshot {
            servo_id: id(servo),
            position,
            speed: 0,
            load: 0,
            voltage: 120,
            temperature,
            updated_at: Instant::now(),
        }
    }

    fn goal(servo: u8, position: u16) -> GoalSnapshot<DynamixelId> {
        GoalSnapshot::in_duration(id(servo), position, Duration::from_millis(100))
    }

    #[test]
    fn test_submit_feedback_merges_and_publishes() {
        let cache = ConcurrentServoCache::new();
        assert_eq!(
            cache.submit_feedback([feedback(1, 100, 40)]),
            SubmitOutcome::Merged
        );
        assert_eq!(cache.read_cached_feedback(id(1)).unwrap().position, 100);
        let entry = cache.entry(id(1)).unwrap();
        assert!(entry.goal().is_none());
        assert!(!cache.move_pending());
    }

    #[test]
    fn test_sentinel_never_merged() {
        let cache = ConcurrentServoCache::new();
        cache.submit_feedback([FeedbackSnapshot::sentinel(id(2))]);
        assert!(cache.is_empty());
        assert!(cache.read_cached_feedback(id(2)).is_none());

        cache.submit_feedback([feedback(2, 300, 45)]);
        cache.submit_feedback([FeedbackSnapshot::sentinel(id(2))]);
        assert_eq!(cache.entry(id(2)).unwrap().feedback().position, 300);
        assert_eq!(cache.read_cached_feedback(id(2)).unwrap().temperature, 45);
    }

    #[test]
    fn test_merge_idempotent() {
        let once = ConcurrentServoCache::new();
        let twice = ConcurrentServoCache::new();
        let snapshot = feedback(3, 512, 50);

        once.submit_feedback([snapshot]);
        twice.submit_feedback([snapshot]);
        twice.submit_feedback([snapshot]);
        assert_eq!(once.entry(id(3)), twice.entry(id(3)));
    }

    #[test]
    fn test_goal_batch_sets_move_pending() {
        let cache = ConcurrentServoCache::new();
        cache.submit_goals(std::iter::empty());
        assert!(!cache.move_pending());

        cache.submit_goals([goal(4, 200)]);
        assert!(cache.move_pending());
        let entry = cache.entry(id(4)).unwrap();
        assert!(entry.feedback().is_sentinel());
        assert!(entry.has_due_goal());
        // 哨兵反馈不发布
        assert!(cache.read_cached_feedback(id(4)).is_none());
    }

    #[test]
    fn test_updates_queued_while_view_held() {
        let cache = ConcurrentServoCache::new();
        cache.submit_feedback([feedback(1, 10, 40)]);

        let view = cache.acquire_batch_view();
        assert_eq!(
            cache.submit_feedback([feedback(1, 20, 41)]),
            SubmitOutcome::Queued
        );
        assert_eq!(cache.submit_goals([goal(1, 500)]), SubmitOutcome::Queued);
        assert_eq!(cache.submit_goals([goal(1, 600)]), SubmitOutcome::Queued);
        assert_eq!(cache.pending_len(), 2);
        assert_eq!(view.get(id(1)).unwrap().feedback().position, 10);
        drop(view);

        assert_eq!(cache.pending_len(), 0);
        let entry = cache.entry(id(1)).unwrap();
        assert_eq!(entry.feedback().position, 20);
        assert_eq!(entry.goal().unwrap().goal_position, 600);
        assert_eq!(cache.read_cached_feedback(id(1)).unwrap().position, 20);
        assert!(cache.move_pending());
    }

    #[test]
    fn test_clear_move_pending_then_queued_goal_sets_again() {
        let cache = ConcurrentServoCache::new();
        cache.submit_goals([goal(1, 100)]);

        let mut view = cache.acquire_batch_view();
        for entry in view.iter_mut() {
            entry.goals_sent();
        }
        cache.submit_goals([goal(1, 150)]);
        view.clear_move_pending();
        assert!(!cache.move_pending());
        drop(view);

        assert!(cache.move_pending());
        assert!(cache.entry(id(1)).unwrap().has_due_goal());
    }

    #[test]
    fn test_view_merge_operations() {
        let cache = ConcurrentServoCache::new();
        let mut view = cache.acquire_batch_view();
        assert!(view.merge_feedback([feedback(7, 1, 30)]));
        assert!(!view.merge_feedback([FeedbackSnapshot::sentinel(id(7))]));
        view.merge_goals([goal(7, 900)]);
        assert!(view.move_pending());
        assert_eq!(view.len(), 1);
        drop(view);

        assert_eq!(cache.read_cached_feedback(id(7)).unwrap().position, 1);
    }

    #[test]
    fn test_no_lost_update_sequence() {
        let cache = ConcurrentServoCache::new();
        let mut rng = rand::thread_rng();
        let mut expected_goal: HashMap<DynamixelId, u16> = HashMap::new();
        let mut expected_pos: HashMap<DynamixelId, u16> = HashMap::new();

        let view = cache.acquire_batch_view();
        for _ in 0..200 {
            let servo = rng.gen_range(0..8u8);
            let value = rng.gen_range(0..1024u16);
            if rng.gen_bool(0.5) {
                cache.submit_goals([goal(servo, value)]);
                expected_goal.insert(id(servo), value);
            } else {
                cache.submit_feedback([feedback(servo, value, 40)]);
                expected_pos.insert(id(servo), value);
            }
        }
        drop(view);

        for (servo, value) in expected_goal {
            assert_eq!(cache.entry(servo).unwrap().goal().unwrap().goal_position, value);
        }
        for (servo, value) in expected_pos {
            assert_eq!(cache.entry(servo).unwrap().feedback().position, value);
            assert_eq!(cache.read_cached_feedback(servo).unwrap().position, value);
        }
    }

    #[test]
    fn test_no_lost_update_concurrent() {
        let cache = Arc::new(ConcurrentServoCache::new());
        let view = cache.acquire_batch_view();

        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for step in 0..50u16 {
                        cache.submit_goals([goal(t, step)]);
                        cache.submit_feedback([feedback(t + 10, step, 40)]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        drop(view);

        for t in 0..4u8 {
            assert_eq!(cache.entry(id(t)).unwrap().goal().unwrap().goal_position, 49);
            assert_eq!(cache.entry(id(t + 10)).unwrap().feedback().position, 49);
        }
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn test_contended_submitters_without_view() {
        let cache = Arc::new(ConcurrentServoCache::new());
        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for step in 1..=200u16 {
                        cache.submit_feedback([feedback(t, step, 40)]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.pending_len(), 0);
        for t in 0..4u8 {
            assert_eq!(cache.read_cached_feedback(id(t)).unwrap().position, 200);
        }
    }

    #[test]
    fn test_enabled_flags() {
        let cache: ConcurrentServoCache<DynamixelId> = ConcurrentServoCache::new();
        assert!(cache.is_enabled(id(1)));
        cache.set_enabled(id(1), false);
        assert!(!cache.is_enabled(id(1)));
        assert!(cache.acquire_batch_view().is_enabled(id(2)));
        cache.set_enabled(id(1), true);
        assert!(cache.is_enabled(id(1)));
    }
}
