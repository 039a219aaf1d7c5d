use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

type Callback<A> = Arc<dyn Fn(A) + Send + Sync>;

/// A scheduled trailing call.
struct Pending<A> {
  /// `None` when no runtime was available to run the timer
  handle: Option<JoinHandle<()>>,
  /// Arguments waiting to be delivered. Whoever takes them runs the callback.
  args: Arc<Mutex<Option<A>>>,
}

impl<A> Pending<A> {
  fn abort(&self) {
    if let Some(handle) = &self.handle {
      handle.abort();
    }
  }

  fn is_waiting(&self) -> bool {
    match &self.handle {
      Some(handle) => !handle.is_finished(),
      None => self
        .args
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some(),
    }
  }
}

/// Delays a callback until `delay` has passed without another call.
///
/// Each [`call`](Debouncer::call) cancels the pending timer and reschedules,
/// so the callback runs at most once per quiet period and only with the most
/// recent arguments. Dropping the debouncer releases the pending timer.
pub struct Debouncer<A: Send + 'static> {
  delay: Duration,
  callback: Callback<A>,
  pending: Mutex<Option<Pending<A>>>,
}

impl<A: Send + 'static> Debouncer<A> {
  pub fn new<F>(delay: Duration, callback: F) -> Self
  where
    F: Fn(A) + Send + Sync + 'static,
  {
    Self {
      delay,
      callback: Arc::new(callback),
      pending: Mutex::new(None),
    }
  }

  pub fn delay(&self) -> Duration {
    self.delay
  }

  /// Schedule the callback with `args`, replacing any pending call.
  ///
  /// Outside a tokio runtime no timer can be started: the arguments are kept
  /// and only delivered by [`flush`](Debouncer::flush).
  pub fn call(&self, args: A) {
    let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(previous) = pending.take() {
      previous.abort();
    }

    let slot = Arc::new(Mutex::new(Some(args)));
    let Ok(runtime) = Handle::try_current() else {
      warn!("No async runtime, debounced call held until flush");
      *pending = Some(Pending { handle: None, args: slot });
      return;
    };

    let task_slot = Arc::clone(&slot);
    let callback = Arc::clone(&self.callback);
    let delay = self.delay;

    let handle = runtime.spawn(async move {
      tokio::time::sleep(delay).await;
      let args = task_slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
      if let Some(args) = args {
        callback(args);
      }
    });

    *pending = Some(Pending {
      handle: Some(handle),
      args: slot,
    });
  }

  /// Whether a call is scheduled and has not fired yet.
  pub fn is_pending(&self) -> bool {
    self
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .as_ref()
      .map(Pending::is_waiting)
      .unwrap_or(false)
  }

  /// Drop the pending call without running it.
  pub fn cancel(&self) {
    if let Some(pending) = self
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      pending.abort();
    }
  }

  /// Run the pending call now instead of waiting for the timer.
  ///
  /// Returns `true` if a call was delivered.
  pub fn flush(&self) -> bool {
    let pending = self
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    let Some(pending) = pending else {
      return false;
    };
    pending.abort();

    let args = pending
      .args
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    match args {
      Some(args) => {
        (self.callback)(args);
        true
      }
      None => false,
    }
  }
}

impl<A: Send + 'static> Drop for Debouncer<A> {
  fn drop(&mut self) {
    self.cancel();
  }
}

impl<A: Send + 'static> std::fmt::Debug for Debouncer<A> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Debouncer")
      .field("delay", &self.delay)
      .field("pending", &self.is_pending())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::time::Instant;

  type Calls = Arc<Mutex<Vec<(&'static str, Duration)>>>;

  fn recording(start: Instant) -> (Calls, impl Fn(&'static str) + Send + Sync + 'static) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    let callback = move |query: &'static str| {
      sink.lock().unwrap().push((query, start.elapsed()));
    };
    (calls, callback)
  }

  #[tokio::test(start_paused = true)]
  async fn test_only_last_call_fires_after_quiet_period() {
    let start = Instant::now();
    let (calls, callback) = recording(start);
    let debouncer = Debouncer::new(Duration::from_millis(300), callback);

    debouncer.call("c");
    tokio::time::sleep(Duration::from_millis(100)).await;
    debouncer.call("ca");
    tokio::time::sleep(Duration::from_millis(100)).await;
    debouncer.call("car");

    tokio::time::sleep(Duration::from_millis(299)).await;
    assert!(calls.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "car");
    assert!(calls[0].1 >= Duration::from_millis(500));
    assert!(calls[0].1 < Duration::from_millis(510));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_prevents_call() {
    let (calls, callback) = recording(Instant::now());
    let debouncer = Debouncer::new(Duration::from_millis(100), callback);

    debouncer.call("x");
    assert!(debouncer.is_pending());
    debouncer.cancel();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(calls.lock().unwrap().is_empty());
    assert!(!debouncer.is_pending());
  }

  #[tokio::test(start_paused = true)]
  async fn test_drop_releases_pending_timer() {
    let (calls, callback) = recording(Instant::now());
    {
      let debouncer = Debouncer::new(Duration::from_millis(100), callback);
      debouncer.call("x");
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(calls.lock().unwrap().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_flush_runs_pending_once() {
    let (calls, callback) = recording(Instant::now());
    let debouncer = Debouncer::new(Duration::from_millis(100), callback);

    debouncer.call("now");
    assert!(debouncer.flush());
    assert!(!debouncer.flush());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "now");
  }

  #[test]
  fn test_call_without_runtime_waits_for_flush() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    let debouncer = Debouncer::new(Duration::from_millis(100), move |q: &'static str| {
      sink.lock().unwrap().push(q);
    });

    debouncer.call("a");
    debouncer.call("ab");
    assert!(debouncer.is_pending());
    assert!(calls.lock().unwrap().is_empty());

    assert!(debouncer.flush());
    assert!(!debouncer.is_pending());
    assert_eq!(*calls.lock().unwrap(), vec!["ab"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_separate_quiet_periods_fire_separately() {
    let (calls, callback) = recording(Instant::now());
    let debouncer = Debouncer::new(Duration::from_millis(100), callback);

    debouncer.call("a");
    tokio::time::sleep(Duration::from_millis(200)).await;
    debouncer.call("b");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let names: Vec<_> = calls.lock().unwrap().iter().map(|(n, _)| *n).collect();
    assert_eq!(names, vec!["a", "b"]);
  }
}
