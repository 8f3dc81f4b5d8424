//! Ordered timer queue.
//!
//! Timers are keyed by `(absolute deadline in monotonic ms, id)`, so two
//! timers with the same deadline fire in creation order. A timer is
//! one-shot or recurring; a recurring timer that fell behind re-anchors
//! at `now + period` instead of bursting to catch up. A *condition* timer
//! additionally holds a weak reference and skips its callback once the
//! referent is gone.
//!
//! The queue itself owns no thread: the reactor asks for
//! [`TimerQueue::next_expiry`] before blocking and drains
//! [`TimerQueue::collect_expired`] after waking. Inserting a new head
//! emits the injected front-insert notification so the waiter can
//! re-evaluate its deadline.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use once_cell::sync::OnceCell;

use crate::clock;

/// Reject a clock that jumped back by more than this as a rollback and
/// flush everything; anything smaller is assumed to be NTP slew.
const ROLLBACK_THRESHOLD_MS: u64 = 60 * 60 * 1000;

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerData {
    deadline: u64,
    period: u64,
    recurring: bool,
    /// Cleared on cancel and on one-shot expiry.
    callback: Option<TimerCallback>,
}

pub(crate) struct TimerInner {
    id: u64,
    data: Mutex<TimerData>,
}

/// Handle to a scheduled timer; cheap to clone via the contained `Arc`.
pub struct Timer {
    inner: Arc<TimerInner>,
    queue: Weak<TimerQueue>,
}

impl Timer {
    /// Remove a pending firing. Returns `false` when the timer already
    /// fired (one-shot) or was cancelled before.
    pub fn cancel(&self) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let mut state = queue.state.write().unwrap();
        let mut data = self.inner.data.lock().unwrap();
        if data.callback.is_none() {
            return false;
        }
        data.callback = None;
        state.timers.remove(&(data.deadline, self.inner.id));
        true
    }

    /// Re-anchor the deadline at `now + period`.
    pub fn refresh(&self) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let mut state = queue.state.write().unwrap();
        let mut data = self.inner.data.lock().unwrap();
        if data.callback.is_none() {
            return false;
        }
        if state
            .timers
            .remove(&(data.deadline, self.inner.id))
            .is_none()
        {
            return false;
        }
        data.deadline = clock::monotonic_ms() + data.period;
        state.timers.insert((data.deadline, self.inner.id), self.inner.clone());
        true
    }

    /// Change the period and re-anchor: at `now` with `from_now`, at the
    /// original start otherwise.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        let Some(queue) = self.queue.upgrade() else {
            return false;
        };
        let at_front = {
            let mut state = queue.state.write().unwrap();
            let mut data = self.inner.data.lock().unwrap();
            if period_ms == data.period && !from_now {
                return true;
            }
            if data.callback.is_none() {
                return false;
            }
            if state
                .timers
                .remove(&(data.deadline, self.inner.id))
                .is_none()
            {
                return false;
            }
            let start = if from_now {
                clock::monotonic_ms()
            } else {
                data.deadline - data.period
            };
            data.period = period_ms;
            data.deadline = start + period_ms;
            state.timers.insert((data.deadline, self.inner.id), self.inner.clone());
            state.timers.keys().next() == Some(&(data.deadline, self.inner.id))
                && !queue.tickled.swap(true, Ordering::SeqCst)
        };
        if at_front {
            queue.notify_front();
        }
        true
    }
}

struct QueueState {
    timers: BTreeMap<(u64, u64), Arc<TimerInner>>,
    /// Last observed clock value, for rollback detection.
    previous_ms: u64,
}

pub(crate) struct TimerQueue {
    state: RwLock<QueueState>,
    /// Suppresses repeated front-insert notifications until the waiter
    /// looks at the queue again.
    tickled: AtomicBool,
    next_id: AtomicU64,
    on_front: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

impl TimerQueue {
    pub(crate) fn new() -> Arc<TimerQueue> {
        Arc::new(TimerQueue {
            state: RwLock::new(QueueState {
                timers: BTreeMap::new(),
                previous_ms: clock::monotonic_ms(),
            }),
            tickled: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            on_front: OnceCell::new(),
        })
    }

    /// Install the front-insert notification; the reactor points this at
    /// its tickle.
    pub(crate) fn set_front_notify(&self, f: impl Fn() + Send + Sync + 'static) {
        if self.on_front.set(Box::new(f)).is_err() {
            panic!("the front-insert notification is already installed");
        }
    }

    fn notify_front(&self) {
        if let Some(f) = self.on_front.get() {
            f();
        }
    }

    /// An owned handle; sound because [`TimerQueue::new`] only ever hands
    /// the queue out inside an [`Arc`].
    fn arc_self(&self) -> Arc<TimerQueue> {
        unsafe {
            Arc::increment_strong_count(self as *const TimerQueue);
            Arc::from_raw(self as *const TimerQueue)
        }
    }

    pub(crate) fn add_timer(
        &self,
        interval_ms: u64,
        callback: TimerCallback,
        recurring: bool,
    ) -> Timer {
        let inner = Arc::new(TimerInner {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            data: Mutex::new(TimerData {
                deadline: clock::monotonic_ms() + interval_ms,
                period: interval_ms,
                recurring,
                callback: Some(callback),
            }),
        });
        let at_front = {
            let mut state = self.state.write().unwrap();
            let data = inner.data.lock().unwrap();
            let key = (data.deadline, inner.id);
            state.timers.insert(key, inner.clone());
            state.timers.keys().next() == Some(&key)
                && !self.tickled.swap(true, Ordering::SeqCst)
        };
        if at_front {
            self.notify_front();
        }
        Timer {
            inner,
            queue: Arc::downgrade(&self.arc_self()),
        }
    }

    /// Like [`Self::add_timer`], but the callback only runs while the
    /// weakly referenced condition is still alive. The firing itself (and
    /// a recurring reschedule) happens either way.
    pub(crate) fn add_condition_timer(
        &self,
        interval_ms: u64,
        callback: TimerCallback,
        condition: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Timer {
        let conditional: TimerCallback = Arc::new(move || {
            if condition.upgrade().is_some() {
                callback();
            }
        });
        self.add_timer(interval_ms, conditional, recurring)
    }

    /// Milliseconds until the head timer fires; 0 when overdue, `None`
    /// when the queue is empty.
    pub(crate) fn next_expiry(&self) -> Option<u64> {
        self.tickled.store(false, Ordering::SeqCst);
        let state = self.state.read().unwrap();
        let (&(deadline, _), _) = state.timers.iter().next()?;
        Some(deadline.saturating_sub(clock::monotonic_ms()))
    }

    pub(crate) fn has_timer(&self) -> bool {
        !self.state.read().unwrap().timers.is_empty()
    }

    /// Pop every timer with `deadline <= now` (all of them after a clock
    /// rollback) and return their callbacks in firing order; recurring
    /// timers are reinserted at `now + period`.
    pub(crate) fn collect_expired(&self) -> Vec<TimerCallback> {
        let now = clock::monotonic_ms();
        {
            let state = self.state.read().unwrap();
            if state.timers.is_empty() {
                return Vec::new();
            }
        }
        let mut state = self.state.write().unwrap();
        let rollover = {
            let previous = state.previous_ms;
            state.previous_ms = now;
            now < previous && now < previous.saturating_sub(ROLLBACK_THRESHOLD_MS)
        };
        if !rollover {
            match state.timers.keys().next() {
                Some(&(deadline, _)) if deadline <= now => {}
                _ => return Vec::new(),
            }
        }

        let expired: Vec<Arc<TimerInner>> = if rollover {
            let all = std::mem::take(&mut state.timers);
            all.into_values().collect()
        } else {
            let keep = state.timers.split_off(&(now + 1, 0));
            let expired = std::mem::replace(&mut state.timers, keep);
            expired.into_values().collect()
        };

        let mut callbacks = Vec::with_capacity(expired.len());
        for inner in expired {
            let mut data = inner.data.lock().unwrap();
            let Some(cb) = data.callback.clone() else {
                continue;
            };
            callbacks.push(cb);
            if data.recurring {
                data.deadline = now + data.period;
                let key = (data.deadline, inner.id);
                drop(data);
                state.timers.insert(key, inner.clone());
            } else {
                data.callback = None;
            }
        }
        callbacks
    }
}
