use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cancel::{CancelManager, NeverCancel};

/// Errors from lock acquisition and release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("lock not acquired: timed out, cancelled or would block")]
    NotAcquired,
    #[error("lock released by a thread that does not hold it")]
    NotOwner,
}

impl LockError {
    /// Whether this error means the caller chose not to wait.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::NotAcquired)
    }
}

/// How long an acquire may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// If false, fail instead of waiting when the lock is not immediately available.
    pub blocking: bool,
    /// Maximum time to wait. `None` waits forever. Ignored when not blocking.
    pub timeout: Option<Duration>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            blocking: true,
            timeout: None,
        }
    }
}

impl AcquireOptions {
    pub fn non_blocking() -> Self {
        Self {
            blocking: false,
            timeout: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            blocking: true,
            timeout: Some(timeout),
        }
    }

    fn is_unbounded(&self) -> bool {
        self.blocking && self.timeout.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Unique,
    Shared,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    thread: ThreadId,
    mode: Mode,
    unbounded: bool,
}

#[derive(Debug, Default)]
struct LockState {
    unique_owner: Option<ThreadId>,
    unique_count: usize,
    shared: HashMap<ThreadId, usize>,
    /// Admission queue ordered by ticket.
    queue: BTreeMap<u64, Waiter>,
    next_ticket: u64,
}

impl LockState {
    fn enqueue(&mut self, waiter: Waiter) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.queue.insert(ticket, waiter);
        ticket
    }

    fn can_acquire(&self, mode: Mode, me: ThreadId, ticket: u64) -> bool {
        match mode {
            Mode::Unique => {
                if self.unique_owner == Some(me) {
                    return true;
                }
                self.unique_owner.is_none()
                    && self.queue.keys().next() == Some(&ticket)
                    && self.shared.keys().all(|holder| *holder == me)
            }
            Mode::Shared => {
                if self.unique_owner == Some(me) || self.shared.contains_key(&me) {
                    return true;
                }
                // Pending writers are never overtaken by new readers.
                self.unique_owner.is_none()
                    && !self
                        .queue
                        .range(..ticket)
                        .any(|(_, waiter)| waiter.mode == Mode::Unique)
            }
        }
    }

    fn grant(&mut self, mode: Mode, me: ThreadId) {
        match mode {
            Mode::Unique => {
                self.unique_owner = Some(me);
                self.unique_count += 1;
            }
            Mode::Shared => {
                *self.shared.entry(me).or_insert(0) += 1;
            }
        }
    }

    /// A blocking, unbounded unique request from a shared holder while another
    /// shared holder already waits unbounded for unique can never be admitted.
    fn warns_deadlock(&self, mode: Mode, options: AcquireOptions, me: ThreadId) -> bool {
        mode == Mode::Unique && options.is_unbounded() && self.probable_deadlock(me)
    }

    fn probable_deadlock(&self, me: ThreadId) -> bool {
        self.shared.contains_key(&me)
            && self.queue.values().any(|waiter| {
                waiter.mode == Mode::Unique
                    && waiter.unbounded
                    && waiter.thread != me
                    && self.shared.contains_key(&waiter.thread)
            })
    }
}

#[derive(Debug, Default)]
struct LockInner {
    state: Mutex<LockState>,
    condvar: Condvar,
}

/// A reentrant lock that can be held in unique or shared mode.
///
/// Unique mode admits one thread; shared mode admits any number of threads
/// while no other thread holds unique. A thread holding either mode may
/// acquire either mode again without blocking itself. Requests are admitted
/// in FIFO order and a queued unique request blocks later shared requests
/// from threads that do not already hold the lock.
#[derive(Debug, Default)]
pub struct ShareableLock {
    inner: Arc<LockInner>,
}

impl ShareableLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire in unique mode. Returns true if the lock was acquired.
    ///
    /// Prefer [`unique`](Self::unique) which releases automatically.
    pub fn acquire_unique(&self, options: AcquireOptions, cancel: &dyn CancelManager) -> bool {
        self.acquire(Mode::Unique, options, cancel)
    }

    /// Acquire in shared mode. Returns true if the lock was acquired.
    ///
    /// Prefer [`shared`](Self::shared) which releases automatically.
    pub fn acquire_shared(&self, options: AcquireOptions, cancel: &dyn CancelManager) -> bool {
        self.acquire(Mode::Shared, options, cancel)
    }

    /// Release one unique hold owned by the calling thread.
    pub fn release_unique(&self) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut state = self.inner.state.lock();
        if state.unique_owner != Some(me) {
            return Err(LockError::NotOwner);
        }
        state.unique_count -= 1;
        if state.unique_count == 0 {
            state.unique_owner = None;
            self.inner.condvar.notify_all();
        }
        Ok(())
    }

    /// Release one shared hold owned by the calling thread.
    pub fn release_shared(&self) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut state = self.inner.state.lock();
        let Some(count) = state.shared.get_mut(&me) else {
            return Err(LockError::NotOwner);
        };
        *count -= 1;
        if *count == 0 {
            state.shared.remove(&me);
            self.inner.condvar.notify_all();
        }
        Ok(())
    }

    /// Block until the lock is held in unique mode.
    pub fn unique(&self) -> Result<UniqueGuard<'_>, LockError> {
        self.unique_with(AcquireOptions::default(), &NeverCancel)
    }

    /// Acquire in unique mode with explicit wait options.
    pub fn unique_with(
        &self,
        options: AcquireOptions,
        cancel: &dyn CancelManager,
    ) -> Result<UniqueGuard<'_>, LockError> {
        if !self.acquire_unique(options, cancel) {
            return Err(LockError::NotAcquired);
        }
        Ok(UniqueGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Block until the lock is held in shared mode.
    pub fn shared(&self) -> Result<SharedGuard<'_>, LockError> {
        self.shared_with(AcquireOptions::default(), &NeverCancel)
    }

    /// Acquire in shared mode with explicit wait options.
    pub fn shared_with(
        &self,
        options: AcquireOptions,
        cancel: &dyn CancelManager,
    ) -> Result<SharedGuard<'_>, LockError> {
        if !self.acquire_shared(options, cancel) {
            return Err(LockError::NotAcquired);
        }
        Ok(SharedGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Whether any thread holds the lock in unique mode.
    pub fn is_unique_held(&self) -> bool {
        self.inner.state.lock().unique_owner.is_some()
    }

    /// Number of threads holding the lock in shared mode.
    pub fn shared_holders(&self) -> usize {
        self.inner.state.lock().shared.len()
    }

    /// Number of requests currently waiting for admission.
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    fn acquire(&self, mode: Mode, options: AcquireOptions, cancel: &dyn CancelManager) -> bool {
        // Registered outside the state lock: cancel() runs callbacks that take it.
        let inner = Arc::downgrade(&self.inner);
        let callback_id = cancel.register_on_cancel(Arc::new(move || {
            if let Some(inner) = inner.upgrade() {
                let _state = inner.state.lock();
                inner.condvar.notify_all();
            }
        }));
        let acquired = self.acquire_queued(mode, options, cancel);
        cancel.unregister_on_cancel(callback_id);
        acquired
    }

    fn acquire_queued(
        &self,
        mode: Mode,
        options: AcquireOptions,
        cancel: &dyn CancelManager,
    ) -> bool {
        let me = thread::current().id();
        let mut state = self.inner.state.lock();

        if state.warns_deadlock(mode, options, me) {
            tracing::warn!(
                thread = ?me,
                "probable deadlock: shared holder requested unique while another shared holder waits for unique"
            );
        }

        let ticket = state.enqueue(Waiter {
            thread: me,
            mode,
            unbounded: options.is_unbounded(),
        });
        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);

        let acquired = loop {
            if cancel.is_cancel_requested() {
                break false;
            }
            if state.can_acquire(mode, me, ticket) {
                break true;
            }
            if !options.blocking {
                break false;
            }
            match deadline {
                None => self.inner.condvar.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        break false;
                    }
                    self.inner.condvar.wait_until(&mut state, deadline);
                }
            }
        };

        state.queue.remove(&ticket);
        if acquired {
            state.grant(mode, me);
        }
        // Leaving the queue may admit requests that were behind this one.
        self.inner.condvar.notify_all();
        tracing::trace!(?mode, acquired, "lock acquire finished");
        acquired
    }
}

/// Unique hold on a [`ShareableLock`], released on drop.
#[derive(Debug)]
pub struct UniqueGuard<'a> {
    lock: &'a ShareableLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for UniqueGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release_unique() {
            tracing::error!(%err, "failed to release unique lock");
        }
    }
}

/// Shared hold on a [`ShareableLock`], released on drop.
#[derive(Debug)]
pub struct SharedGuard<'a> {
    lock: &'a ShareableLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release_shared() {
            tracing::error!(%err, "failed to release shared lock");
        }
    }
}
