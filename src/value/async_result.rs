//! Single-assignment host result with one continuation slot.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::VmError;

/// Lifecycle of an `AsyncResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncState {
    /// Nothing settled, no continuation registered.
    Init,
    /// A continuation is waiting for the outcome.
    Pending,
    Success,
    Error,
}

type SuccessFn<T> = Box<dyn FnOnce(T)>;
type FailureFn = Box<dyn FnOnce(VmError)>;

struct Inner<T> {
    outcome: Option<Result<T, VmError>>,
    on_success: Option<SuccessFn<T>>,
    on_failure: Option<FailureFn>,
}

/// A value that may arrive later.
///
/// Settles at most once. `then` registers the continuation; if the result is
/// already settled the matching arm runs immediately. Cloning shares the slot.
pub struct AsyncResult<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> Default for AsyncResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> AsyncResult<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                outcome: None,
                on_success: None,
                on_failure: None,
            })),
        }
    }

    pub fn resolved(value: T) -> Self {
        let result = Self::new();
        result.resolve(value);
        result
    }

    pub fn rejected(error: VmError) -> Self {
        let result = Self::new();
        result.reject(error);
        result
    }

    pub fn state(&self) -> AsyncState {
        let inner = self.inner.borrow();
        match &inner.outcome {
            Some(Ok(_)) => AsyncState::Success,
            Some(Err(_)) => AsyncState::Error,
            None if inner.on_success.is_some() || inner.on_failure.is_some() => AsyncState::Pending,
            None => AsyncState::Init,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.borrow().outcome.is_some()
    }

    /// A copy of the outcome, if settled.
    pub fn outcome(&self) -> Option<Result<T, VmError>> {
        self.inner.borrow().outcome.clone()
    }

    /// Settle successfully. Returns `false` if the result was already settled.
    pub fn resolve(&self, value: T) -> bool {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            if inner.outcome.is_some() {
                return false;
            }
            inner.outcome = Some(Ok(value.clone()));
            inner.on_failure = None;
            inner.on_success.take()
        };
        if let Some(callback) = callback {
            callback(value);
        }
        true
    }

    /// Settle with an error. Returns `false` if the result was already settled.
    pub fn reject(&self, error: VmError) -> bool {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            if inner.outcome.is_some() {
                return false;
            }
            inner.outcome = Some(Err(error.clone()));
            inner.on_success = None;
            inner.on_failure.take()
        };
        if let Some(callback) = callback {
            callback(error);
        }
        true
    }

    /// Register the continuation, replacing any earlier one.
    pub fn then<S, F>(&self, on_success: S, on_failure: F)
    where
        S: FnOnce(T) + 'static,
        F: FnOnce(VmError) + 'static,
    {
        let settled = self.inner.borrow().outcome.clone();
        match settled {
            Some(Ok(value)) => on_success(value),
            Some(Err(error)) => on_failure(error),
            None => {
                let mut inner = self.inner.borrow_mut();
                inner.on_success = Some(Box::new(on_success));
                inner.on_failure = Some(Box::new(on_failure));
            }
        }
    }

    pub fn ptr_eq(&self, other: &AsyncResult<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + 'static> fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AsyncResult({:?})", self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_states() {
        let result: AsyncResult<i64> = AsyncResult::new();
        assert_eq!(result.state(), AsyncState::Init);
        result.then(|_| {}, |_| {});
        assert_eq!(result.state(), AsyncState::Pending);
        result.resolve(1);
        assert_eq!(result.state(), AsyncState::Success);
    }

    #[test]
    fn test_continuation_runs_on_resolve() {
        let seen = Rc::new(Cell::new(0));
        let result: AsyncResult<i64> = AsyncResult::new();
        let sink = seen.clone();
        result.then(move |v| sink.set(v), |_| panic!("should not fail"));
        assert_eq!(seen.get(), 0);
        assert!(result.resolve(7));
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn test_settles_once() {
        let result: AsyncResult<i64> = AsyncResult::new();
        assert!(result.reject(VmError::host("boom")));
        assert!(!result.resolve(3));
        assert_eq!(result.state(), AsyncState::Error);
        assert!(matches!(result.outcome(), Some(Err(_))));
    }

    #[test]
    fn test_then_after_settlement_runs_immediately() {
        let result = AsyncResult::resolved(5_i64);
        let seen = Rc::new(Cell::new(0));
        let sink = seen.clone();
        result.then(move |v| sink.set(v), |_| {});
        assert_eq!(seen.get(), 5);
    }

    #[test]
    fn test_callback_may_inspect_result() {
        let result: AsyncResult<i64> = AsyncResult::new();
        let probe = result.clone();
        let seen = Rc::new(Cell::new(false));
        let sink = seen.clone();
        result.then(
            move |_| sink.set(probe.state() == AsyncState::Success),
            |_| {},
        );
        result.resolve(1);
        assert!(seen.get());
    }
}
