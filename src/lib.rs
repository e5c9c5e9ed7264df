//! Parking ingress/egress tracking from camera streams.
//!
//! Each camera gets a [`worker::CameraWorker`] that samples frames for plates,
//! resolves entrance/exit events against the [`ledger::Ledger`], and publishes
//! annotated frames for the MJPEG endpoint.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod debounce;
pub mod error;
pub mod events;
pub mod ledger;
pub mod models;
pub mod registry;
pub mod retention;
pub mod source;
pub mod worker;

pub use error::{Error, Result};
