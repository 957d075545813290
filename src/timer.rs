// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Single-shot timer wheel backed by one kernel timer descriptor.
//!
//! The descriptor is armed to the earliest pending expiry and wrapped in a
//! synthetic connection registered in the owning reactor's multiplexer; when
//! the descriptor fires, the reactor dispatches that connection's handler,
//! which drains the wheel via [`TimerWheel::process`]: every expired entry
//! runs and the descriptor is re-armed (or disarmed).

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use mio::Interest;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use slab::Slab;

use crate::connection::Connection;
use crate::net::socket::Socket;

/// Monotonic milliseconds since a process-fixed epoch. Never the wall clock.
pub fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

fn from_now(expire_at: u64) -> u64 {
    expire_at.saturating_sub(now_ms())
}

fn lock_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "could not take a lock on mutex")
}

/// Stable opaque identity of a pending timer, returned by
/// [`TimerWheel::add`]. Refreshing a timer yields a new handle; stale
/// handles are inert and can never remove a slot that was reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    key: usize,
    expire_at: u64,
}

impl TimerHandle {
    /// Absolute expiry in monotonic milliseconds.
    pub fn expire_at(&self) -> u64 {
        self.expire_at
    }
}

struct SingleTimer {
    expire_at: u64,
    callback: Box<dyn FnOnce() + Send>,
}

struct WheelInner {
    entries: Slab<SingleTimer>,
    order: BTreeSet<(u64, usize)>,
    next_expire: Option<u64>,
}

/// Ordered set of single-shot timers sharing one timer descriptor, plus the
/// synthetic connection wrapping that descriptor for reactor dispatch.
///
/// The interior mutex serializes handler-driven refreshes against the
/// reactor's own add/remove during connection lifecycle events.
pub struct TimerWheel {
    fd: Arc<TimerFd>,
    conn: Mutex<Option<Box<Connection>>>,
    inner: Mutex<WheelInner>,
}

impl TimerWheel {
    /// Creates an empty wheel with a disarmed, non-blocking descriptor. The
    /// descriptor is wrapped in a read-interested synthetic connection whose
    /// handler drains the wheel.
    pub fn new() -> io::Result<Arc<Self>> {
        let fd = Arc::new(
            TimerFd::new(
                ClockId::CLOCK_MONOTONIC,
                TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
            )
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?,
        );
        let wheel = Arc::new(Self {
            fd: Arc::clone(&fd),
            conn: Mutex::new(None),
            inner: Mutex::new(WheelInner {
                entries: Slab::new(),
                order: BTreeSet::new(),
                next_expire: None,
            }),
        });

        let mut conn = Box::new(Connection::new(Socket::Timer(fd)));
        conn.set_interest(Interest::READABLE);
        let drainer = Arc::downgrade(&wheel);
        conn.set_handler(Arc::new(move |_conn: &mut Connection| {
            if let Some(wheel) = drainer.upgrade() {
                wheel.process();
            }
        }));
        *wheel.conn.lock().map_err(|_| lock_error())? = Some(conn);
        Ok(wheel)
    }

    /// The raw timer descriptor, for multiplexer registration.
    pub fn fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }

    /// Checks the synthetic timer connection out for dispatch.
    pub(crate) fn take_connection(&self) -> Option<Box<Connection>> {
        let mut slot = self.conn.lock().ok()?;
        slot.take()
    }

    /// Parks the synthetic timer connection again after dispatch.
    pub(crate) fn restore_connection(&self, conn: Box<Connection>) {
        if let Ok(mut slot) = self.conn.lock() {
            *slot = Some(conn);
        }
    }

    /// Schedules `callback` to run `expire_from_now` milliseconds from now.
    pub fn add(
        &self,
        expire_from_now: u64,
        callback: impl FnOnce() + Send + 'static,
    ) -> io::Result<TimerHandle> {
        let expire_at = now_ms() + expire_from_now;
        let mut inner = self.inner.lock().map_err(|_| lock_error())?;
        let key = inner.entries.insert(SingleTimer {
            expire_at,
            callback: Box::new(callback),
        });
        inner.order.insert((expire_at, key));
        self.rearm(&mut inner);
        Ok(TimerHandle { key, expire_at })
    }

    /// Cancels a pending timer. Returns false when the handle no longer
    /// names a live entry (already fired, removed, or refreshed).
    pub fn remove(&self, handle: TimerHandle) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            log::error!("timer wheel: could not take a lock on mutex");
            return false;
        };
        match inner.entries.get(handle.key) {
            Some(entry) if entry.expire_at == handle.expire_at => {}
            _ => return false,
        }
        inner.entries.remove(handle.key);
        inner.order.remove(&(handle.expire_at, handle.key));
        self.rearm(&mut inner);
        true
    }

    /// Expiry of the next timer to fire, if any.
    pub fn next_expiry(&self) -> Option<u64> {
        let inner = self.inner.lock().ok()?;
        inner.order.iter().next().map(|&(expire_at, _)| expire_at)
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.entries.len())
    }

    /// Whether no timers are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the descriptor and runs every expired callback, in expiry
    /// order. Extraction and re-arming happen under the wheel's mutex; the
    /// callbacks run after it is released.
    pub fn process(&self) {
        // the expiration count is informational only
        let mut count = [0u8; 8];
        let _ = nix::unistd::read(self.fd(), &mut count);

        let expired = {
            let Ok(mut inner) = self.inner.lock() else {
                log::error!("timer wheel: could not take a lock on mutex");
                return;
            };
            let now = now_ms();
            let mut expired = Vec::new();
            while let Some((expire_at, key)) = inner.order.pop_first() {
                if expire_at > now {
                    inner.order.insert((expire_at, key));
                    break;
                }
                expired.push(inner.entries.remove(key));
            }
            self.rearm(&mut inner);
            expired
        };

        for timer in expired {
            (timer.callback)();
        }
    }

    fn rearm(&self, inner: &mut WheelInner) {
        let new_next = inner.order.iter().next().map(|&(expire_at, _)| expire_at);
        if new_next == inner.next_expire {
            return;
        }
        let result = match new_next {
            None => self.fd.unset(),
            Some(expire_at) => {
                // a zero it_value disarms, so a due-now expiry arms 1 ms out
                let delay = Duration::from_millis(from_now(expire_at).max(1));
                self.fd.set(
                    Expiration::OneShot(TimeSpec::from_duration(delay)),
                    TimerSetTimeFlags::empty(),
                )
            }
        };
        match result {
            // the target is recorded only once the descriptor reflects it;
            // after a failed arm the next mutation retries the syscall
            Ok(()) => inner.next_expire = new_next,
            Err(errno) => {
                log::error!("timer wheel: failed to arm timer descriptor: {errno}");
            }
        }
    }
}

impl fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerWheel")
            .field("fd", &self.fd())
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn earliest_entry_is_next_to_expire() {
        let wheel = TimerWheel::new().unwrap();
        let later = wheel.add(5_000, || {}).unwrap();
        let sooner = wheel.add(1_000, || {}).unwrap();
        assert_eq!(wheel.next_expiry(), Some(sooner.expire_at()));

        assert!(wheel.remove(sooner));
        assert_eq!(wheel.next_expiry(), Some(later.expire_at()));

        assert!(wheel.remove(later));
        assert_eq!(wheel.next_expiry(), None);
        assert!(wheel.is_empty());
    }

    #[test]
    fn stale_handles_are_inert() {
        let wheel = TimerWheel::new().unwrap();
        let handle = wheel.add(1_000, || {}).unwrap();
        assert!(wheel.remove(handle));
        assert!(!wheel.remove(handle));
    }

    #[test]
    fn refresh_strictly_extends_expiry() {
        let wheel = TimerWheel::new().unwrap();
        let first = wheel.add(500, || {}).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(wheel.remove(first));
        let second = wheel.add(500, || {}).unwrap();
        assert!(second.expire_at() > first.expire_at());
    }

    #[test]
    fn expired_entries_run_in_order() {
        let wheel = TimerWheel::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let first = Arc::clone(&fired);
        wheel
            .add(10, move || {
                first.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let second = Arc::clone(&fired);
        wheel
            .add(20, move || {
                second.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let unexpired = Arc::clone(&fired);
        wheel
            .add(60_000, move || {
                unexpired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        wheel.process();

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn due_now_timer_still_fires() {
        let wheel = TimerWheel::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        wheel
            .add(0, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        wheel.process();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn synthetic_connection_drains_the_wheel() {
        let wheel = TimerWheel::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        wheel
            .add(10, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        thread::sleep(Duration::from_millis(40));

        let mut conn = wheel.take_connection().unwrap();
        assert_eq!(conn.fd(), wheel.fd());
        let handler = conn.handler().unwrap();
        handler(&mut conn);
        wheel.restore_connection(conn);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(wheel.take_connection().is_some());
    }
}
