// Cycle clock for procsim: barrier between core workers plus backup ticking
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Period of the backup clock that ticks while no process is running
pub const BACKUP_TICK_PERIOD: Duration = Duration::from_micros(100);

#[derive(Debug, Default)]
struct BarrierState {
    waiting: usize,
    active: usize,
    generation: u64,
    shutdown: bool,
}

/// Dynamic-quorum barrier driving the global cycle counter.
///
/// The quorum is the number of processes currently bound to a core (at
/// least 1). Each active worker calls [`CycleBarrier::sync`] once per
/// instruction round; the last arrival closes the round, bumps the counter
/// by exactly one and releases everyone.
pub struct CycleBarrier {
    state: Mutex<BarrierState>,
    round_closed: Condvar,
    cycles: AtomicU64,
}

impl CycleBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            round_closed: Condvar::new(),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    /// Number of processes currently counted in the quorum
    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Zero the counter and clear any state left by a previous run
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = BarrierState::default();
        self.cycles.store(0, Ordering::Release);
    }

    /// A process was bound to a core
    pub fn enter(&self) {
        self.state.lock().active += 1;
    }

    /// A process left its core. Closes the round if everyone still active
    /// is already waiting on it.
    pub fn leave(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if state.waiting > 0 && state.waiting >= state.active.max(1) {
            self.close_round(&mut state);
        } else {
            // idle workers wait for active to drop as well
            self.round_closed.notify_all();
        }
    }

    /// Wait for the current round to close. Returns `false` once shut down.
    pub fn sync(&self) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }

        state.waiting += 1;
        if state.waiting >= state.active.max(1) {
            self.close_round(&mut state);
            return true;
        }

        let generation = state.generation;
        while state.generation == generation && !state.shutdown {
            self.round_closed.wait(&mut state);
        }
        state.generation != generation
    }

    /// Sit out one round without counting towards the quorum.
    ///
    /// Used by a worker that found nothing to dispatch. Returns immediately
    /// when no process is running, since the backup clock owns those rounds.
    pub fn idle_round(&self) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        let generation = state.generation;
        while state.generation == generation && state.active > 0 && !state.shutdown {
            self.round_closed.wait(&mut state);
        }
    }

    /// Backup path: advance one cycle if nothing is running
    pub fn tick_if_idle(&self) -> bool {
        let mut state = self.state.lock();
        if state.active > 0 || state.shutdown {
            return false;
        }
        self.close_round(&mut state);
        true
    }

    /// Release every waiter; later `sync` calls return `false` immediately
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.round_closed.notify_all();
    }

    fn close_round(&self, state: &mut BarrierState) {
        state.waiting = 0;
        state.generation += 1;
        let cycle = self.cycles.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("cycle {} closed ({} active)", cycle, state.active);
        self.round_closed.notify_all();
    }
}

impl Default for CycleBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic wake-up with an interruptible wait.
///
/// [`PeriodicTimer::wait_tick`] sleeps for one period on a condition
/// variable, so [`PeriodicTimer::stop`] wakes the owner at once instead of
/// after the next poll.
pub struct PeriodicTimer {
    period: Duration,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl PeriodicTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait one period. Returns `false` once the timer has been stopped.
    pub fn wait_tick(&self) -> bool {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return false;
        }
        self.wake.wait_for(&mut stopped, self.period);
        !*stopped
    }

    pub fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    pub fn reset(&self) {
        *self.stopped.lock() = false;
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn single_active_worker_closes_every_round() {
        let barrier = CycleBarrier::new();
        barrier.enter();
        for expected in 1..=5 {
            assert!(barrier.sync());
            assert_eq!(barrier.cycles(), expected);
        }
    }

    #[test]
    fn quorum_of_three_advances_once_per_round() {
        let barrier = Arc::new(CycleBarrier::new());
        for _ in 0..3 {
            barrier.enter();
        }

        let rounds = 50;
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    for _ in 0..rounds {
                        assert!(barrier.sync());
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(barrier.cycles(), rounds);
    }

    #[test]
    fn leaving_worker_releases_waiters() {
        let barrier = Arc::new(CycleBarrier::new());
        barrier.enter();
        barrier.enter();

        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.sync())
        };
        while barrier.state.lock().waiting == 0 {
            thread::yield_now();
        }
        barrier.leave();
        assert!(waiter.join().unwrap());
        assert_eq!(barrier.cycles(), 1);
        assert_eq!(barrier.active(), 1);
    }

    #[test]
    fn backup_tick_only_when_idle() {
        let barrier = CycleBarrier::new();
        assert!(barrier.tick_if_idle());
        assert_eq!(barrier.cycles(), 1);
        barrier.enter();
        assert!(!barrier.tick_if_idle());
        assert_eq!(barrier.cycles(), 1);
    }

    #[test]
    fn shutdown_wakes_blocked_sync() {
        let barrier = Arc::new(CycleBarrier::new());
        barrier.enter();
        barrier.enter();
        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.sync())
        };
        while barrier.state.lock().waiting == 0 {
            thread::yield_now();
        }
        barrier.shutdown();
        assert!(!waiter.join().unwrap());
        assert!(!barrier.sync());
    }

    #[test]
    fn reset_zeroes_counter() {
        let barrier = CycleBarrier::new();
        barrier.tick_if_idle();
        barrier.shutdown();
        barrier.reset();
        assert_eq!(barrier.cycles(), 0);
        assert!(barrier.tick_if_idle());
    }

    #[test]
    fn stopping_timer_interrupts_wait() {
        let timer = Arc::new(PeriodicTimer::new(Duration::from_secs(30)));
        let sleeper = {
            let timer = Arc::clone(&timer);
            thread::spawn(move || timer.wait_tick())
        };
        let started = Instant::now();
        thread::sleep(Duration::from_millis(20));
        timer.stop();
        assert!(!sleeper.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!timer.wait_tick());
    }
}
