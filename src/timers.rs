use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

/// Named, cancellable deadlines owned by a single actor.
///
/// Arming a name that is already armed replaces its deadline. `expired()`
/// is cancel-safe: a deadline is only removed once it has fired.
#[derive(Debug)]
pub(crate) struct Timers<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K> Timers<K>
where
    K: Copy + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
        }
    }

    pub fn arm(&mut self, key: K, after: Duration) {
        self.arm_at(key, Instant::now() + after);
    }

    pub fn arm_at(&mut self, key: K, deadline: Instant) {
        self.deadlines.insert(key, deadline);
    }

    pub fn cancel(&mut self, key: K) {
        self.deadlines.remove(&key);
    }

    pub fn is_armed(&self, key: K) -> bool {
        self.deadlines.contains_key(&key)
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    /// Waits for the earliest deadline and returns its name.
    /// Never resolves while no timer is armed.
    pub async fn expired(&mut self) -> K {
        let Some((key, deadline)) = self
            .deadlines
            .iter()
            .min_by_key(|(_, deadline)| **deadline)
            .map(|(k, d)| (*k, *d))
        else {
            return std::future::pending().await;
        };
        sleep_until(deadline).await;
        self.deadlines.remove(&key);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Name {
        Short,
        Long,
    }

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_order() {
        let mut timers = Timers::new();
        timers.arm(Name::Long, Duration::from_secs(5));
        timers.arm(Name::Short, Duration::from_secs(1));
        assert_eq!(timers.expired().await, Name::Short);
        assert_eq!(timers.expired().await, Name::Long);
        assert!(!timers.is_armed(Name::Long));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timers_never_fire() {
        let mut timers = Timers::new();
        timers.arm(Name::Short, Duration::from_secs(1));
        timers.arm(Name::Long, Duration::from_secs(2));
        timers.cancel(Name::Short);
        let start = Instant::now();
        assert_eq!(timers.expired().await, Name::Long);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_deadline() {
        let mut timers = Timers::new();
        timers.arm(Name::Short, Duration::from_secs(1));
        timers.arm(Name::Short, Duration::from_secs(3));
        let start = Instant::now();
        timers.expired().await;
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }
}
