//! On-device control core for a small greenhouse.
//!
//! Sensor readers feed filtered values into notification channels,
//! controllers react to those values by driving actuators, a day/night
//! schedule gates which controllers may act, and a reporter publishes
//! periodic telemetry snapshots.
//!
//! Everything here runs on one cooperative executor (a tokio `LocalSet`).
//! Shared state lives behind `Rc` + `Cell`/`RefCell` and no borrow is held
//! across an `.await`. The only source of true asynchrony is hardware
//! interrupts, which may touch nothing but an [`hw::AbortSignal`].

pub mod actuator;
pub mod controller;
pub mod daynight;
pub mod error;
pub mod filter;
pub mod hw;
pub mod logic;
pub mod observable;
pub mod roof;
pub mod sensor;
pub mod telemetry;

pub use error::{Error, Result};
