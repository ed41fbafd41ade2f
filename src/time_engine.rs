//! TimeEngine (C4): virtual clock and release-time pacing.
//!
//! Cooperative cancellation via `tokio::select!` against a `watch` channel,
//! the same pattern the teacher's `websocket::service::WsService::run` uses
//! for its polling loop, generalized here from a fixed interval to a
//! speed-factor-scaled sleep computed per event.

use crate::core_types::Nanos;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

/// Cooperative signal observed between events; set by the Session loop in
/// response to Pause/Stop commands (spec §4.3, §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Stop,
}

pub struct TimeEngine {
    current_ns: AtomicI64,
    speed_factor: Arc<std::sync::RwLock<f64>>,
    control_rx: watch::Receiver<ControlSignal>,
}

impl TimeEngine {
    pub fn new(start_ns: Nanos, speed_factor: f64, control_rx: watch::Receiver<ControlSignal>) -> Self {
        Self {
            current_ns: AtomicI64::new(start_ns),
            speed_factor: Arc::new(std::sync::RwLock::new(speed_factor)),
            control_rx,
        }
    }

    pub fn current_ns(&self) -> Nanos {
        self.current_ns.load(Ordering::Acquire)
    }

    pub fn set_speed(&self, factor: f64) {
        debug_assert!(factor >= 0.0);
        *self.speed_factor.write().expect("speed_factor lock poisoned") = factor;
    }

    fn speed(&self) -> f64 {
        *self.speed_factor.read().expect("speed_factor lock poisoned")
    }

    /// Advances `current_ns` to `target_ns` without sleeping, discarding any
    /// pacing (spec §4.3 `jump`/`fast_forward`).
    pub fn jump(&self, target_ns: Nanos) {
        self.current_ns.store(target_ns, Ordering::Release);
    }

    /// Waits until `t_ev` should be released at the configured speed,
    /// honoring Pause/Stop observed via the control channel. Returns
    /// `Err(())` if Stop was observed before release (caller should end the
    /// session loop without advancing the clock).
    pub async fn release(&mut self, t_ev: Nanos) -> Result<(), ()> {
        loop {
            match *self.control_rx.borrow() {
                ControlSignal::Stop => return Err(()),
                ControlSignal::Pause => {
                    // Wait for the signal to change before computing pacing.
                    if self.control_rx.changed().await.is_err() {
                        return Err(());
                    }
                    continue;
                }
                ControlSignal::Run => {}
            }

            let speed = self.speed();
            if speed == 0.0 {
                self.current_ns.store(t_ev, Ordering::Release);
                return Ok(());
            }

            let now_ns = self.current_ns.load(Ordering::Acquire);
            let delta_ns = (t_ev - now_ns).max(0) as f64 / speed;
            let sleep_dur = Duration::from_nanos(delta_ns.round().max(0.0) as u64);

            tokio::select! {
                _ = tokio::time::sleep(sleep_dur) => {
                    self.current_ns.store(t_ev, Ordering::Release);
                    return Ok(());
                }
                changed = self.control_rx.changed() => {
                    if changed.is_err() {
                        return Err(());
                    }
                    if *self.control_rx.borrow() == ControlSignal::Stop {
                        return Err(());
                    }
                    // Pause observed mid-sleep: loop back around and re-evaluate.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_speed_releases_immediately() {
        let (_tx, rx) = watch::channel(ControlSignal::Run);
        let mut engine = TimeEngine::new(0, 0.0, rx);
        engine.release(5_000_000_000).await.unwrap();
        assert_eq!(engine.current_ns(), 5_000_000_000);
    }

    #[tokio::test]
    async fn stop_signal_aborts_release() {
        let (tx, rx) = watch::channel(ControlSignal::Run);
        let mut engine = TimeEngine::new(0, 1.0, rx);
        tx.send(ControlSignal::Stop).unwrap();
        assert!(engine.release(1_000_000_000).await.is_err());
    }

    #[test]
    fn jump_sets_current_ns_without_pacing() {
        let (_tx, rx) = watch::channel(ControlSignal::Run);
        let engine = TimeEngine::new(0, 1.0, rx);
        engine.jump(42);
        assert_eq!(engine.current_ns(), 42);
    }
}
