//! Rate limiting primitives for UI-triggered work.
//!
//! - [`Debouncer`] collapses a burst of calls into one trailing call with the
//!   latest arguments (search-as-you-type).
//! - [`Throttle`] runs the first call of a window and drops the rest
//!   (scroll/resize handlers, network status, double-submit guards).
//!
//! Both schedule through the tokio timer and must be created inside a runtime.

mod debounce;
mod throttle;

pub use debounce::Debouncer;
pub use throttle::Throttle;
