//! A shared timer facility for one-shot, re-armable callouts.
//!
//! One [`CalloutService`] fires the callouts of all instances in a scope.
//! Each [`Callout`] has a fixed function and at most one pending deadline;
//! re-arming replaces the deadline. Callouts never run concurrently with
//! themselves, since a service runs one function at a time.
//!
//! The threaded service runs callouts on its own worker thread. The manual
//! service has no thread and no real clock: time only moves, and callouts
//! only fire, inside [`CalloutService::advance`].
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

pub(crate) type CalloutFn = Arc<dyn Fn() + Send + Sync>;

struct Slot {
    func: CalloutFn,
    deadline: Option<Duration>,
    // bumped on every re-arm, queue entries with an older seq are stale
    seq: u64,
}

#[derive(Default)]
struct Wheel {
    slots: HashMap<u64, Slot>,
    queue: BinaryHeap<Reverse<(Duration, u64, u64)>>,
    next_id: u64,
    next_seq: u64,
    running: Option<(u64, ThreadId)>,
    manual_now: Duration,
    shutdown: bool,
}

impl Wheel {
    fn is_live(&self, deadline: Duration, seq: u64, id: u64) -> bool {
        self.slots
            .get(&id)
            .is_some_and(|s| s.seq == seq && s.deadline == Some(deadline))
    }

    fn next_deadline(&mut self) -> Option<Duration> {
        while let Some(Reverse((deadline, seq, id))) = self.queue.peek().copied()
        {
            if self.is_live(deadline, seq, id) {
                return Some(deadline);
            }
            self.queue.pop();
        }
        None
    }

    // Remove the earliest callout due at `now`, returning its id, function
    // and deadline.
    fn pop_due(&mut self, now: Duration) -> Option<(u64, CalloutFn, Duration)> {
        let deadline = self.next_deadline()?;
        if deadline > now {
            return None;
        }
        let Reverse((_, _, id)) = self.queue.pop()?;
        let slot = self.slots.get_mut(&id)?;
        slot.deadline = None;
        Some((id, Arc::clone(&slot.func), deadline))
    }

    fn cancel(&mut self, id: u64) -> bool {
        self.slots
            .get_mut(&id)
            .is_some_and(|s| s.deadline.take().is_some())
    }
}

enum Clock {
    Real(Instant),
    Manual,
}

struct Shared {
    wheel: Mutex<Wheel>,
    cond: Condvar,
    clock: Clock,
}

impl Shared {
    fn now(&self, wheel: &Wheel) -> Duration {
        match self.clock {
            Clock::Real(start) => start.elapsed(),
            Clock::Manual => wheel.manual_now,
        }
    }

    // Run one popped callout with the wheel unlocked.
    fn fire(&self, wheel: &mut MutexGuard<'_, Wheel>, id: u64, func: CalloutFn) {
        wheel.running = Some((id, thread::current().id()));
        MutexGuard::unlocked(wheel, || func());
        wheel.running = None;
        self.cond.notify_all();
    }
}

//------------ CalloutService ------------------------------------------------

pub struct CalloutService {
    shared: Arc<Shared>,
    worker: Mutex<Option<(ThreadId, JoinHandle<()>)>>,
}

impl CalloutService {
    /// A service with a worker thread and the real clock.
    pub fn threaded() -> Result<Self, std::io::Error> {
        let shared = Arc::new(Shared {
            wheel: Mutex::new(Wheel::default()),
            cond: Condvar::new(),
            clock: Clock::Real(Instant::now()),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("fib_algo-callout".to_string())
            .spawn(move || run_worker(worker_shared))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some((handle.thread().id(), handle))),
        })
    }

    /// A service without a thread, driven by [`advance`](Self::advance).
    pub fn manual() -> Self {
        Self {
            shared: Arc::new(Shared {
                wheel: Mutex::new(Wheel::default()),
                cond: Condvar::new(),
                clock: Clock::Manual,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.shared.clock, Clock::Manual)
    }

    /// Time elapsed since the service was created.
    pub fn now(&self) -> Duration {
        let wheel = self.shared.wheel.lock();
        self.shared.now(&wheel)
    }

    /// Move the clock of a manual service forward by `by`, firing every
    /// callout that becomes due on the calling thread, in deadline order.
    /// Callouts armed by a firing callout are fired too if they fall inside
    /// the window.
    pub fn advance(&self, by: Duration) {
        if !self.is_manual() {
            warn!("advance() called on a threaded callout service");
            return;
        }
        let mut wheel = self.shared.wheel.lock();
        let target = wheel.manual_now + by;
        while let Some((id, func, deadline)) = wheel.pop_due(target) {
            wheel.manual_now = wheel.manual_now.max(deadline);
            self.shared.fire(&mut wheel, id, func);
        }
        wheel.manual_now = target;
    }

    /// Number of armed callouts.
    pub fn pending(&self) -> usize {
        self.shared
            .wheel
            .lock()
            .slots
            .values()
            .filter(|s| s.deadline.is_some())
            .count()
    }

    pub(crate) fn callout(&self, func: CalloutFn) -> Callout {
        let mut wheel = self.shared.wheel.lock();
        let id = wheel.next_id;
        wheel.next_id += 1;
        wheel.slots.insert(
            id,
            Slot {
                func,
                deadline: None,
                seq: 0,
            },
        );
        Callout {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop the worker thread. Pending callouts never fire afterwards.
    pub fn shutdown(&self) {
        self.shared.wheel.lock().shutdown = true;
        self.shared.cond.notify_all();

        if let Some((tid, handle)) = self.worker.lock().take() {
            // Dropped from inside a callout: the worker exits on its own.
            if tid != thread::current().id() && handle.join().is_err() {
                warn!("callout worker panicked");
            }
        }
    }
}

impl Drop for CalloutService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CalloutService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalloutService")
            .field("manual", &self.is_manual())
            .field("now", &self.now())
            .finish()
    }
}

fn run_worker(shared: Arc<Shared>) {
    debug!("callout worker started");
    let mut wheel = shared.wheel.lock();
    loop {
        if wheel.shutdown {
            break;
        }
        let now = shared.now(&wheel);
        if let Some((id, func, _)) = wheel.pop_due(now) {
            shared.fire(&mut wheel, id, func);
            continue;
        }
        match wheel.next_deadline() {
            Some(deadline) => {
                shared
                    .cond
                    .wait_for(&mut wheel, deadline.saturating_sub(now));
            }
            None => shared.cond.wait(&mut wheel),
        }
    }
    debug!("callout worker stopped");
}

//------------ Callout -------------------------------------------------------

pub(crate) struct Callout {
    id: u64,
    shared: Arc<Shared>,
}

impl Callout {
    /// Arm the callout to fire `delay` from now, replacing any pending
    /// deadline.
    pub fn reset(&self, delay: Duration) {
        let mut wheel = self.shared.wheel.lock();
        if wheel.shutdown {
            return;
        }
        let deadline = self.shared.now(&wheel) + delay;
        wheel.next_seq += 1;
        let seq = wheel.next_seq;
        let Some(slot) = wheel.slots.get_mut(&self.id) else {
            return;
        };
        slot.deadline = Some(deadline);
        slot.seq = seq;
        wheel.queue.push(Reverse((deadline, seq, self.id)));
        trace!("callout {} armed in {:?}", self.id, delay);
        self.shared.cond.notify_all();
    }

    /// Cancel a pending firing without waiting for one in progress.
    /// Returns whether a firing was pending.
    pub fn stop(&self) -> bool {
        self.shared.wheel.lock().cancel(self.id)
    }

    /// Cancel a pending firing and wait for one in progress on another
    /// thread to finish. From inside the callout itself this is `stop()`.
    pub fn drain(&self) {
        let mut wheel = self.shared.wheel.lock();
        wheel.cancel(self.id);
        let me = thread::current().id();
        while wheel
            .running
            .is_some_and(|(id, tid)| id == self.id && tid != me)
        {
            self.shared.cond.wait(&mut wheel);
        }
        // the firing we waited for may have re-armed us
        wheel.cancel(self.id);
    }

    pub fn pending(&self) -> bool {
        self.shared
            .wheel
            .lock()
            .slots
            .get(&self.id)
            .is_some_and(|s| s.deadline.is_some())
    }

    /// Whether the current thread is executing this callout's function.
    pub fn is_running_here(&self) -> bool {
        self.shared
            .wheel
            .lock()
            .running
            .is_some_and(|(id, tid)| id == self.id && tid == thread::current().id())
    }

    /// Time left until the pending firing.
    #[cfg(test)]
    pub fn remaining(&self) -> Option<Duration> {
        let wheel = self.shared.wheel.lock();
        let now = self.shared.now(&wheel);
        wheel
            .slots
            .get(&self.id)
            .and_then(|s| s.deadline)
            .map(|d| d.saturating_sub(now))
    }
}

impl Drop for Callout {
    fn drop(&mut self) {
        self.shared.wheel.lock().slots.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting(service: &CalloutService) -> (Callout, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let c = service.callout(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        (c, hits)
    }

    #[test]
    fn manual_fires_at_deadline() {
        let service = CalloutService::manual();
        let (c, hits) = counting(&service);

        c.reset(Duration::from_secs(30));
        service.advance(Duration::from_secs(29));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(c.remaining(), Some(Duration::from_secs(1)));

        service.advance(Duration::from_secs(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!c.pending());

        service.advance(Duration::from_secs(60));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_replaces_deadline() {
        let service = CalloutService::manual();
        let (c, hits) = counting(&service);

        c.reset(Duration::from_secs(30));
        c.reset(Duration::from_millis(50));
        service.advance(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // the 30s entry was superseded
        service.advance(Duration::from_secs(30));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_and_drain_cancel() {
        let service = CalloutService::manual();
        let (c, hits) = counting(&service);

        c.reset(Duration::from_millis(10));
        assert!(c.stop());
        assert!(!c.stop());
        c.reset(Duration::from_millis(10));
        c.drain();
        service.advance(Duration::from_secs(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(service.pending(), 0);
    }

    #[test]
    fn threaded_fires() -> Result<(), Box<dyn std::error::Error>> {
        let service = CalloutService::threaded()?;
        let (c, hits) = counting(&service);

        c.reset(Duration::from_millis(5));
        let start = Instant::now();
        while hits.load(Ordering::SeqCst) == 0
            && start.elapsed() < Duration::from_secs(5)
        {
            thread::sleep(Duration::from_millis(1));
        }
        c.drain();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        service.shutdown();
        Ok(())
    }
}
