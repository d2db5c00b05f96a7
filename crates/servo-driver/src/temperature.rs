//! 过热保护
//!
//! 每个周期检查已发布的反馈表：温度超过上限的舵机关闭力矩并退出
//! 移动，降到冷却阈值以下后重新打开。关闭命令对每次过热只发一次。

use crate::cache::ConcurrentServoCache;
use crate::command::CommandQueue;
use crate::error::DriverError;
use crate::family::ServoFamily;
use crate::metrics::LoopMetrics;
use crate::settings::ControlSettings;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::marker::PhantomData;
use tracing::{info, warn};

pub struct TemperatureMonitor<F: ServoFamily> {
    hot: HashSet<F::Id>,
    _family: PhantomData<F>,
}

impl<F: ServoFamily> Default for TemperatureMonitor<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ServoFamily> TemperatureMonitor<F> {
    pub fn new() -> Self {
        Self {
            hot: HashSet::new(),
            _family: PhantomData,
        }
    }

    pub fn is_hot(&self, id: F::Id) -> bool {
        self.hot.contains(&id)
    }

    pub fn hot_servos(&self) -> impl Iterator<Item = F::Id> + '_ {
        self.hot.iter().copied()
    }

    /// 新过热的舵机（温度严格大于 `max_temperature`），并记入过热集合
    pub fn find_hot(
        &mut self,
        cache: &ConcurrentServoCache<F::Id>,
        max_temperature: u16,
    ) -> SmallVec<[F::Id; 4]> {
        let table = cache.feedback_table();
        let mut found = SmallVec::new();
        for feedback in table.values() {
            if feedback.temperature > max_temperature && self.hot.insert(feedback.servo_id) {
                found.push(feedback.servo_id);
            }
        }
        found.sort();
        found
    }

    /// 已冷却的舵机（温度不高于 `cooldown_temperature`），并移出过热集合
    pub fn find_cooled(
        &mut self,
        cache: &ConcurrentServoCache<F::Id>,
        cooldown_temperature: u16,
    ) -> SmallVec<[F::Id; 4]> {
        let table = cache.feedback_table();
        let mut found: SmallVec<[F::Id; 4]> = self
            .hot
            .iter()
            .copied()
            .filter(|id| {
                table
                    .get(id)
                    .is_some_and(|f| f.temperature <= cooldown_temperature)
            })
            .collect();
        for id in &found {
            self.hot.remove(id);
        }
        found.sort();
        found
    }

    /// 一次完整检查：为过热舵机入队关闭命令，为冷却舵机入队开启命令
    pub fn check(
        &mut self,
        cache: &ConcurrentServoCache<F::Id>,
        settings: &ControlSettings,
        queue: &CommandQueue,
        metrics: &LoopMetrics,
    ) -> Result<(), DriverError> {
        for id in self.find_hot(cache, settings.max_run_temperature) {
            let temperature = cache
                .read_cached_feedback(id)
                .map_or(0, |f| f.temperature);
            warn!(
                family = F::NAME,
                servo_id = %id,
                temperature,
                limit = settings.max_run_temperature,
                "Servo overheating, disabling torque"
            );
            cache.set_enabled(id, false);
            queue.push(F::torque_command(id, false)?);
            LoopMetrics::incr(&metrics.servos_disabled);
        }

        for id in self.find_cooled(cache, settings.cooldown_temperature) {
            info!(family = F::NAME, servo_id = %id, "Servo cooled down, enabling torque");
            cache.set_enabled(id, true);
            queue.push(F::torque_command(id, true)?);
        }
        Ok(())
    }
}
