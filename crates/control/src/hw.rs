//! Hardware seams. The node binary implements these for real GPIO or for
//! the simulator; the core only ever talks to the traits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::Result;

/// One voltage sample from an analog channel.
pub trait AnalogInput {
    fn read_volts(&mut self) -> Result<f64>;
}

/// One sample of a quantity that needs no voltage calibration
/// (e.g. a digital thermometer that already reports °C).
pub trait SensorInput {
    fn read(&mut self) -> Result<f64>;
}

/// A binary input with an optional rising-edge interrupt.
pub trait DigitalInput {
    fn is_high(&self) -> bool;

    /// Register `handler` to run on every rising edge. The handler runs in
    /// interrupt context (a foreign thread) and must only touch atomics.
    fn on_rising(&mut self, handler: Box<dyn FnMut() + Send + 'static>) -> Result<()>;
}

pub trait DigitalOutput {
    fn set_level(&mut self, high: bool);
}

pub trait PwmOutput {
    /// Apply `duty` out of `max` to the output.
    fn set_duty(&mut self, duty: u16, max: u16) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Open,
    Close,
}

/// Step/direction motor driver (A4988 and friends) plus brake and sleep.
pub trait StepperDriver {
    fn set_brake(&mut self, engaged: bool);
    fn set_sleep(&mut self, asleep: bool);
    fn set_direction(&mut self, direction: Direction);
    fn set_step(&mut self, high: bool);
}

/// Cooperative cancellation flag shared between interrupt handlers and the
/// task running a motor rotation.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from interrupt context.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
