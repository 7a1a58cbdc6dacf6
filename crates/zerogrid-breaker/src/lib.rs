//! zerogrid-breaker — keyed circuit breaking for ZeroGrid.
//!
//! One independent state machine per key (`"{service}:{instance}"`),
//! created lazily on first use:
//!
//! ```text
//!            failures >= threshold
//!   Closed ───────────────────────▶ Open
//!     ▲                              │ reset_timeout elapsed
//!     │ all probes succeed           ▼ (on next call)
//!     └──────────────────────── HalfOpen ──▶ Open (any probe fails)
//! ```
//!
//! Transitions out of `Open` are lazy: nothing runs on a timer, the next
//! call attempt observes the elapsed timeout.

pub mod breaker;

pub use breaker::{CircuitBreaker, Permit};
