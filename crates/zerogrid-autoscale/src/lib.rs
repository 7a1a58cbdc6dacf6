//! zerogrid-autoscale — per-service instance scaling.
//!
//! Owns the instance list of every registered service, decides when to
//! add or remove capacity, and talks to the external `InstanceFactory`.
//!
//! # Scaling Algorithm
//!
//! ```text
//! running = instances in `running` state
//! live    = starting + running + provisioning
//!
//! scale up when (outside scale_up_cooldown, live < max):
//!     queue_depth >= scale_up_threshold
//!  or running > 0 and active >= utilization * running * target_concurrency
//!  or live == 0 and (queue_depth > 0 or active > 0)      // cold start
//!
//! scale down when (outside scale_down_cooldown):
//!     live > min and some running instance has 0 connections
//!     and has been idle longer than the scale-down threshold
//! ```
//!
//! Scale-down never destroys a busy instance: the chosen instance is
//! marked `draining` and polled until its connections reach zero or the
//! drain timeout expires.

pub mod events;
pub mod factory;
pub mod scaler;

pub use events::ScalingEventLog;
pub use factory::InstanceFactory;
pub use scaler::{AutoScaler, Completion, InstanceLease, ScalerStats, ServiceLoad};
