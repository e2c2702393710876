//! `lar-middleware` – session event plumbing
//!
//! Carries map-change notifications, localization results and session
//! alerts from the live mapper to any number of observers (debug renderer,
//! CLI, loggers) without letting a slow observer hold up the mapper.
//!
//! # Modules
//!
//! - [`bus`] – Topic-partitioned publish/subscribe event bus built on Tokio
//!   broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
