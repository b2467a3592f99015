//! # Delivery Module
//!
//! Everything downstream of the identity filter: the bounded queue that
//! decouples filtering from uploading, the `PushTarget` seam the uploader
//! talks to, and the uploader task itself.
//!
//! ## Contained Modules:
//! - **`queue`**: bounded FIFO with in-flight slot accounting and a stop sentinel.
//! - **`push`**: the push trait, its error type and a dry-run target.
//! - **`uploader`**: the retrying background consumer.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Push target abstraction.
pub mod push;
/// Bounded delivery queue.
pub mod queue;
/// Background uploader task.
pub mod uploader;

pub use push::{DryRunPushTarget, PushError, PushTarget};
pub use queue::{DeliveryQueue, QueueFull, QueueItem};
pub use uploader::Uploader;
