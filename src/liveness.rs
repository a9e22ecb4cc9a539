//! Liveness monitor - probes the runner and declares it dead on silence.
//!
//! While the runner is ready, a probe timer fires every `interval`. Each tick
//! sends a ping and arms a deadline (unless one is already armed). Any sign
//! of life from the runner cancels the armed deadline. If the deadline fires
//! first, both timers are cancelled and the target's dead handler runs once.
//! Nothing restarts the cycle except the next [`LivenessMonitor::start`].
//!
//! ```text
//!        start()            tick: ping + arm           deadline fires
//! Idle ─────────► Alive ───────────────────► Probing ─────────────────► Dead
//!                   ▲                           │
//!                   └──── observe_liveness() ───┘
//! ```
//!
//! Timers are tokio tasks held by abortable handles; tests drive them with
//! tokio's paused clock.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::error::Result;

/// What the monitor probes and whom it tells when the runner is dead.
pub trait ProbeTarget: Send + Sync + 'static {
    /// Send a ping to the runner. Not a correlated call.
    fn send_probe(&self) -> Result<()>;

    /// The runner missed a deadline.
    fn on_dead(&self);
}

/// Observable state of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    /// Not monitoring.
    Idle,
    /// Monitoring, no probe outstanding.
    Alive,
    /// A probe is outstanding.
    Probing,
    /// The last probe went unanswered.
    Dead,
}

struct MonitorState {
    phase: LivenessState,
    probe: Option<JoinHandle<()>>,
    deadline: Option<(u64, JoinHandle<()>)>,
    next_deadline: u64,
}

struct MonitorInner {
    interval: Duration,
    deadline: Duration,
    target: Arc<dyn ProbeTarget>,
    state: Mutex<MonitorState>,
}

/// Probe/deadline timer pair for one runner instance.
pub struct LivenessMonitor {
    inner: Arc<MonitorInner>,
}

impl LivenessMonitor {
    /// Create an idle monitor.
    pub fn new(interval: Duration, deadline: Duration, target: Arc<dyn ProbeTarget>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                interval,
                deadline,
                target,
                state: Mutex::new(MonitorState {
                    phase: LivenessState::Idle,
                    probe: None,
                    deadline: None,
                    next_deadline: 0,
                }),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> LivenessState {
        self.inner.state.lock().phase
    }

    /// Start (or restart) the probe cadence.
    pub fn start(&self) {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("No tokio runtime; liveness probing disabled");
            return;
        };

        let mut state = self.inner.state.lock();
        cancel_timers(&mut state);

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.interval;
        state.probe = Some(runtime.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.probe(),
                    None => return,
                }
            }
        }));
        state.phase = LivenessState::Alive;
        tracing::debug!("Liveness probing started every {:?}", period);
    }

    /// Stop probing and cancel any armed deadline.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        cancel_timers(&mut state);
        state.phase = LivenessState::Idle;
    }

    /// Send one probe now without touching the cadence.
    pub fn probe_now(&self) {
        if Handle::try_current().is_err() {
            tracing::warn!("No tokio runtime; probe skipped");
            return;
        }
        self.inner.probe();
    }

    /// Record evidence that the runner is alive.
    ///
    /// Cancels the armed deadline, if any. Returns whether one was cancelled.
    pub fn observe_liveness(&self) -> bool {
        let mut state = self.inner.state.lock();
        match state.deadline.take() {
            Some((_, handle)) => {
                handle.abort();
                state.phase = LivenessState::Alive;
                true
            }
            None => false,
        }
    }

    /// Whether a deadline is currently armed.
    pub fn has_deadline(&self) -> bool {
        self.inner.state.lock().deadline.is_some()
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        cancel_timers(&mut self.inner.state.lock());
    }
}

fn cancel_timers(state: &mut MonitorState) {
    if let Some(probe) = state.probe.take() {
        probe.abort();
    }
    if let Some((_, deadline)) = state.deadline.take() {
        deadline.abort();
    }
}

impl MonitorInner {
    fn probe(self: &Arc<Self>) {
        if let Err(e) = self.target.send_probe() {
            tracing::warn!("Liveness probe could not be sent: {}", e);
        }

        let mut state = self.state.lock();
        if state.deadline.is_some() {
            return;
        }

        state.next_deadline += 1;
        let seq = state.next_deadline;
        let weak = Arc::downgrade(self);
        let after = self.deadline;
        let handle = tokio::spawn(async move {
            time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(seq);
            }
        });
        state.deadline = Some((seq, handle));
        state.phase = LivenessState::Probing;
    }

    fn expire(&self, seq: u64) {
        {
            let mut state = self.state.lock();
            match &state.deadline {
                Some((armed, _)) if *armed == seq => {}
                // Cancelled or superseded while this timer was waking up.
                _ => return,
            }
            // Dropping our own handle does not cancel us.
            state.deadline = None;
            if let Some(probe) = state.probe.take() {
                probe.abort();
            }
            state.phase = LivenessState::Dead;
        }

        tracing::warn!("Runner missed its liveness deadline; reloading");
        self.target.on_dead();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const T1: Duration = Duration::from_secs(18);
    const T2: Duration = Duration::from_secs(16);

    #[derive(Default)]
    struct Counting {
        probes: AtomicUsize,
        deaths: AtomicUsize,
    }

    impl ProbeTarget for Counting {
        fn send_probe(&self) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_dead(&self) {
            self.deaths.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn monitor() -> (LivenessMonitor, Arc<Counting>) {
        let target = Arc::new(Counting::default());
        (LivenessMonitor::new(T1, T2, target.clone()), target)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_probe_after_interval() {
        let (monitor, target) = monitor();
        monitor.start();
        assert_eq!(monitor.state(), LivenessState::Alive);

        time::sleep(T1 - ms(1)).await;
        assert_eq!(target.probes.load(Ordering::SeqCst), 0);

        time::sleep(ms(2)).await;
        assert_eq!(target.probes.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.state(), LivenessState::Probing);
        assert!(monitor.has_deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_kills_exactly_once() {
        let (monitor, target) = monitor();
        monitor.start();

        time::sleep(T1 + T2 + ms(1)).await;
        assert_eq!(target.deaths.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.state(), LivenessState::Dead);

        // Probe timer was cancelled with the deadline: no more probes, no more deaths.
        time::sleep(T1 * 5).await;
        assert_eq!(target.probes.load(Ordering::SeqCst), 1);
        assert_eq!(target.deaths.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_cancels_deadline_and_cadence_continues() {
        let (monitor, target) = monitor();
        monitor.start();

        // land just after each tick
        time::sleep(ms(1)).await;
        for round in 1..=4 {
            time::sleep(T1).await;
            assert_eq!(target.probes.load(Ordering::SeqCst), round);
            assert!(monitor.observe_liveness());
            assert_eq!(monitor.state(), LivenessState::Alive);
        }

        time::sleep(T2 * 2).await;
        assert_eq!(target.deaths.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evidence_without_deadline() {
        let (monitor, _target) = monitor();
        monitor.start();
        assert!(!monitor.observe_liveness());
        assert!(!monitor.has_deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_everything() {
        let (monitor, target) = monitor();
        monitor.start();
        time::sleep(T1 + ms(1)).await;
        assert!(monitor.has_deadline());

        monitor.stop();
        assert_eq!(monitor.state(), LivenessState::Idle);

        time::sleep(T1 * 3).await;
        assert_eq!(target.probes.load(Ordering::SeqCst), 1);
        assert_eq!(target.deaths.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_death() {
        let (monitor, target) = monitor();
        monitor.start();
        time::sleep(T1 + T2 + ms(1)).await;
        assert_eq!(monitor.state(), LivenessState::Dead);

        monitor.start();
        time::sleep(T1 + ms(1)).await;
        assert_eq!(target.probes.load(Ordering::SeqCst), 2);
        assert!(monitor.observe_liveness());
        assert_eq!(target.deaths.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_now_arms_deadline() {
        let (monitor, target) = monitor();
        monitor.probe_now();
        assert_eq!(target.probes.load(Ordering::SeqCst), 1);
        assert!(monitor.has_deadline());

        time::sleep(T2 + ms(1)).await;
        assert_eq!(target.deaths.load(Ordering::SeqCst), 1);
    }
}
