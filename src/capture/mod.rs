//! Capture Layer
//!
//! Screen grabbing itself is done by the desktop shell; this layer decodes
//! the captured bytes once and serves pixel crops of it to the recognition
//! orchestrator.

pub mod frame;

pub use frame::CapturedFrame;
