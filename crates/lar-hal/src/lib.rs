//! `lar-hal` – capture and location sources.
//!
//! The mapper never talks to a camera or GPS receiver directly. Anything
//! that can produce poses, frames and fixes implements
//! [`CaptureSource`][capture::CaptureSource].
//!
//! # Modules
//!
//! - [`capture`] – the [`CaptureSource`][capture::CaptureSource] trait and the
//!   [`CaptureEvent`][capture::CaptureEvent] stream it yields.
//! - [`sim`] – [`SimScene`][sim::SimScene]: a deterministic synthetic corridor
//!   walk with ground truth, for tests and demos without a device.
//! - [`replay`] – JSON-Lines recordings: [`ReplayWriter`][replay::ReplayWriter]
//!   captures a session, [`ReplaySource`][replay::ReplaySource] plays it back.

pub mod capture;
pub mod replay;
pub mod sim;

pub use capture::{CaptureEvent, CaptureSource};
pub use replay::{ReplaySource, ReplayWriter};
pub use sim::{SimScene, SimSceneConfig};
