//! Cancellable renew/release timers.
//!
//! A small registry keyed by [`TimerKind`] holds at most one armed timer per
//! kind. Arming replaces (and aborts) the previous entry of that kind. A timer
//! removes its own entry when it fires, before its action runs, so the action
//! may freely re-arm or cancel its own kind.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Deferred work run when a timer fires.
pub type TimerAction = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Renew,
    Release,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::Renew => write!(f, "renew"),
            TimerKind::Release => write!(f, "release"),
        }
    }
}

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Registry {
    next_generation: u64,
    timers: HashMap<TimerKind, ArmedTimer>,
}

/// Registry of armed timers, shared between the client and its timer tasks.
#[derive(Debug, Clone, Default)]
pub struct TimerScheduler {
    registry: Arc<Mutex<Registry>>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `kind` to run `action` after `delay`, replacing any timer of
    /// the same kind.
    pub async fn arm(&self, kind: TimerKind, delay: Duration, action: TimerAction) {
        let mut registry = self.registry.lock().await;

        if let Some(previous) = registry.timers.remove(&kind) {
            previous.handle.abort();
        }

        registry.next_generation += 1;
        let generation = registry.next_generation;
        let deadline = Instant::now() + delay;
        let shared = Arc::clone(&self.registry);

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut registry = shared.lock().await;
                match registry.timers.get(&kind) {
                    Some(entry) if entry.generation == generation => {
                        registry.timers.remove(&kind);
                    }
                    _ => return,
                }
            }
            debug!("{} timer fired", kind);
            action.await;
        });

        debug!("Armed {} timer for {:?}", kind, delay);
        registry.timers.insert(
            kind,
            ArmedTimer {
                generation,
                deadline,
                handle,
            },
        );
    }

    /// Cancels the timer of `kind`. Returns false if none was armed.
    pub async fn cancel(&self, kind: TimerKind) -> bool {
        let removed = self.registry.lock().await.timers.remove(&kind);
        match removed {
            Some(timer) => {
                timer.handle.abort();
                debug!("Cancelled {} timer", kind);
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        let mut registry = self.registry.lock().await;
        for (kind, timer) in registry.timers.drain() {
            timer.handle.abort();
            debug!("Cancelled {} timer", kind);
        }
    }

    pub async fn is_armed(&self, kind: TimerKind) -> bool {
        self.registry.lock().await.timers.contains_key(&kind)
    }

    /// When the armed timer of `kind` is due to fire.
    pub async fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.registry
            .lock()
            .await
            .timers
            .get(&kind)
            .map(|timer| timer.deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn counting_action(counter: &Arc<AtomicUsize>) -> TimerAction {
        let counter = Arc::clone(counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_after_delay() {
        let scheduler = TimerScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler
            .arm(TimerKind::Release, Duration::from_secs(10), counting_action(&fired))
            .await;
        assert!(scheduler.is_armed(TimerKind::Release).await);

        sleep(Duration::from_secs(9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_armed(TimerKind::Release).await);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous() {
        let scheduler = TimerScheduler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        scheduler
            .arm(TimerKind::Renew, Duration::from_secs(5), counting_action(&first))
            .await;
        scheduler
            .arm(TimerKind::Renew, Duration::from_secs(20), counting_action(&second))
            .await;

        let deadline = scheduler.deadline(TimerKind::Renew).await.unwrap();
        assert_eq!(deadline - Instant::now(), Duration::from_secs(20));

        sleep(Duration::from_secs(30)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let scheduler = TimerScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        assert!(!scheduler.cancel(TimerKind::Renew).await);

        scheduler
            .arm(TimerKind::Renew, Duration::from_secs(5), counting_action(&fired))
            .await;
        scheduler
            .arm(TimerKind::Release, Duration::from_secs(5), counting_action(&fired))
            .await;
        assert!(scheduler.cancel(TimerKind::Renew).await);
        assert!(scheduler.is_armed(TimerKind::Release).await);

        scheduler.cancel_all().await;
        assert!(!scheduler.is_armed(TimerKind::Release).await);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_may_rearm_its_own_kind() {
        let scheduler = TimerScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let inner_scheduler = scheduler.clone();
        let inner_counter = Arc::clone(&fired);
        let action: TimerAction = Box::pin(async move {
            inner_counter.fetch_add(1, Ordering::SeqCst);
            inner_scheduler.cancel(TimerKind::Renew).await;
            inner_scheduler
                .arm(
                    TimerKind::Renew,
                    Duration::from_secs(3),
                    counting_action(&inner_counter),
                )
                .await;
        });

        scheduler
            .arm(TimerKind::Renew, Duration::from_secs(1), action)
            .await;

        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_armed(TimerKind::Renew).await);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_armed(TimerKind::Renew).await);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(TimerKind::Renew.to_string(), "renew");
        assert_eq!(TimerKind::Release.to_string(), "release");
    }
}
