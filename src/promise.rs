//! Cross-thread single-shot result cells.
//!
//! A [`Promise`] binds a producer on a daemon thread to any number of
//! consumers. It moves through exactly one terminal transition,
//! `Pending -> Fulfilled | Failed`, and stays there; consumers either poll
//! [`Promise::is_satisfied`] or park on [`Promise::wait`].
//!
//! Producers hold only a `Weak` reference from their queue entries, so a
//! consumer that drops its promise does not pin the queued work; the
//! worker notices the dead weak reference and may skip the operation
//! entirely.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::Error;

enum State<T> {
    Pending,
    Fulfilled(Option<T>),
    Failed(Error),
}

impl<T> State<T> {
    fn is_terminal(&self) -> bool {
        !matches!(self, State::Pending)
    }
}

/// A single-shot result cell shared between threads.
///
/// The plain `Promise` (that is, `Promise<()>`) signals bare completion;
/// `Promise<T>` additionally carries a value retrievable once via
/// [`Promise::take`].
///
/// Setters publish under the cell's mutex and wake all waiters; observers
/// therefore see a fully-written value or error, never a partial one.
pub struct Promise<T = ()> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> Promise<T> {
    /// Creates a pending promise.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            cond: Condvar::new(),
        }
    }

    /// Fulfills the promise with `value`.
    ///
    /// If the promise is already terminal the value is discarded: with
    /// `strict` set this returns [`Error::AlreadySet`], otherwise it is
    /// silently ignored and the first outcome stands.
    pub fn set_success(&self, value: T, strict: bool) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            return if strict { Err(Error::AlreadySet) } else { Ok(()) };
        }
        *state = State::Fulfilled(Some(value));
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Fails the promise with `err`.
    ///
    /// Same already-set behavior as [`Promise::set_success`].
    pub fn set_error(&self, err: Error, strict: bool) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            return if strict { Err(Error::AlreadySet) } else { Ok(()) };
        }
        *state = State::Failed(err);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// True once the promise has reached a terminal state.
    pub fn is_satisfied(&self) -> bool {
        self.state.lock().unwrap().is_terminal()
    }

    /// Re-raises the stored error if the promise failed.
    ///
    /// Pending and fulfilled promises return `Ok(())`.
    pub fn check(&self) -> Result<(), Error> {
        match &*self.state.lock().unwrap() {
            State::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Blocks the calling thread until the promise is terminal or the
    /// timeout elapses. Returns whether the promise is satisfied.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, _timed_out) = self
            .cond
            .wait_timeout_while(state, timeout, |s| !s.is_terminal())
            .unwrap();
        state.is_terminal()
    }

    /// Takes the fulfilled value out of the cell.
    ///
    /// Returns `None` while pending, after failure, or once the value has
    /// already been taken.
    pub fn take(&self) -> Option<T> {
        match &mut *self.state.lock().unwrap() {
            State::Fulfilled(value) => value.take(),
            _ => None,
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock().unwrap() {
            State::Pending => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Failed(_) => "failed",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}
