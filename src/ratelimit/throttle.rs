use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Leading-edge throttle.
///
/// The first call in a window runs immediately; calls within `delay` of the
/// last executed call are dropped. No timers are scheduled, so nothing can
/// fire after [`dispose`](Throttle::dispose) or drop.
pub struct Throttle<A> {
  delay: Duration,
  callback: Box<dyn Fn(A) + Send + Sync>,
  last_run: Mutex<Option<Instant>>,
  disposed: AtomicBool,
}

impl<A> Throttle<A> {
  pub fn new<F>(delay: Duration, callback: F) -> Self
  where
    F: Fn(A) + Send + Sync + 'static,
  {
    Self {
      delay,
      callback: Box::new(callback),
      last_run: Mutex::new(None),
      disposed: AtomicBool::new(false),
    }
  }

  /// Run the callback unless the current window already ran it.
  ///
  /// Returns whether the callback was executed.
  pub fn call(&self, args: A) -> bool {
    if self.disposed.load(Ordering::Acquire) {
      return false;
    }

    {
      let mut last_run = self.last_run.lock().unwrap_or_else(PoisonError::into_inner);
      let now = Instant::now();
      if let Some(last) = *last_run {
        if now.duration_since(last) < self.delay {
          return false;
        }
      }
      *last_run = Some(now);
    }

    (self.callback)(args);
    true
  }

  /// Forget the current window so the next call runs immediately.
  pub fn reset(&self) {
    *self.last_run.lock().unwrap_or_else(PoisonError::into_inner) = None;
  }

  /// Turn every further call into a no-op.
  pub fn dispose(&self) {
    self.disposed.store(true, Ordering::Release);
  }

  pub fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::Acquire)
  }
}

impl<A> std::fmt::Debug for Throttle<A> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Throttle")
      .field("delay", &self.delay)
      .field("disposed", &self.is_disposed())
      .finish_non_exhaustive()
  }
}
