//! Actuators: binary outputs, PWM outputs, and the shared lock/info state
//! every actuator carries.
//!
//! Each physical actuator is constructed exactly once by the composition
//! root and handed (as `Rc`) to the one controller allowed to drive it and
//! to the reporters that only read its status.

use std::cell::{Cell, RefCell};

use tracing::debug;

use crate::hw::{DigitalOutput, PwmOutput};
use crate::observable::Observable;
use crate::{Error, Result};

/// `available`/`info` pair common to all actuators.
pub struct ActuatorStatus {
    available: Observable<bool>,
    info: RefCell<String>,
}

impl ActuatorStatus {
    pub fn new() -> Self {
        Self {
            available: Observable::with_value(true),
            info: RefCell::new(String::new()),
        }
    }

    pub fn available(&self) -> bool {
        self.available.get().unwrap_or(true)
    }

    /// Availability changes, for anyone who wants to watch them.
    pub fn availability(&self) -> &Observable<bool> {
        &self.available
    }

    pub fn info(&self) -> String {
        self.info.borrow().clone()
    }

    pub fn set_info(&self, info: impl Into<String>) {
        *self.info.borrow_mut() = info.into();
    }
}

impl Default for ActuatorStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub trait Actuator {
    fn name(&self) -> &str;
    fn status(&self) -> &ActuatorStatus;
    fn power_on(&self);
    fn power_off(&self);

    fn lock(&self) {
        self.status().available.set(false);
    }

    fn unlock(&self) {
        self.status().available.set(true);
    }

    fn available(&self) -> bool {
        self.status().available()
    }

    fn info(&self) -> String {
        self.status().info()
    }
}

/// Plain digital output: relay, pump, valve.
pub struct OnOffActuator {
    name: String,
    status: ActuatorStatus,
    pin: RefCell<Box<dyn DigitalOutput>>,
    on: Cell<bool>,
}

impl OnOffActuator {
    /// The output is driven off on construction.
    pub fn new(name: impl Into<String>, pin: Box<dyn DigitalOutput>) -> Self {
        let actuator = Self {
            name: name.into(),
            status: ActuatorStatus::new(),
            pin: RefCell::new(pin),
            on: Cell::new(false),
        };
        actuator.power_off();
        actuator
    }

    pub fn is_on(&self) -> bool {
        self.on.get()
    }

    fn drive(&self, on: bool) {
        self.pin.borrow_mut().set_level(on);
        self.on.set(on);
        self.status.set_info(if on { "on" } else { "off" });
        debug!(actuator = %self.name, on, "output set");
    }
}

impl Actuator for OnOffActuator {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> &ActuatorStatus {
        &self.status
    }

    fn power_on(&self) {
        self.drive(true);
    }

    fn power_off(&self) {
        self.drive(false);
    }
}

/// Dimmable output (grow light, heater) with a 10-bit duty range.
pub struct PwmActuator {
    name: String,
    status: ActuatorStatus,
    pin: RefCell<Box<dyn PwmOutput>>,
    duty: Cell<u16>,
}

impl PwmActuator {
    pub const MAX_DUTY: u16 = 1023;

    /// The output is driven to zero duty on construction.
    pub fn new(name: impl Into<String>, pin: Box<dyn PwmOutput>) -> Self {
        let actuator = Self {
            name: name.into(),
            status: ActuatorStatus::new(),
            pin: RefCell::new(pin),
            duty: Cell::new(0),
        };
        actuator.power_off();
        actuator
    }

    pub fn duty(&self) -> u16 {
        self.duty.get()
    }

    /// Map a percentage onto the duty range (`round(p × MAX / 100)`).
    pub fn percent_to_duty(percent: f64) -> i64 {
        (percent * f64::from(Self::MAX_DUTY) / 100.0).round() as i64
    }

    /// Apply a raw duty value. Out-of-range requests leave everything
    /// untouched.
    pub fn set_duty(&self, duty: i64) -> Result<()> {
        if !(0..=i64::from(Self::MAX_DUTY)).contains(&duty) {
            return Err(Error::DutyOutOfRange {
                requested: duty,
                max: Self::MAX_DUTY,
            });
        }
        let duty = duty as u16;
        self.pin.borrow_mut().set_duty(duty, Self::MAX_DUTY)?;
        self.duty.set(duty);
        Ok(())
    }

    /// Set the output to `percent` and record it as the actuator info.
    pub fn set_percentage(&self, percent: f64) -> Result<()> {
        self.set_duty(Self::percent_to_duty(percent))?;
        self.status.set_info(format!("{}%", format_percent(percent)));
        Ok(())
    }

    pub fn increase(&self) -> Result<()> {
        self.set_duty(i64::from(self.duty.get()) + 1)
    }

    pub fn decrease(&self) -> Result<()> {
        self.set_duty(i64::from(self.duty.get()) - 1)
    }
}

impl Actuator for PwmActuator {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> &ActuatorStatus {
        &self.status
    }

    fn power_on(&self) {
        if let Err(e) = self.set_percentage(100.0) {
            tracing::error!(actuator = %self.name, "power on failed: {e}");
        }
    }

    fn power_off(&self) {
        if let Err(e) = self.set_percentage(0.0) {
            tracing::error!(actuator = %self.name, "power off failed: {e}");
        }
    }
}

/// "60" for whole numbers, "12.5" otherwise.
fn format_percent(percent: f64) -> String {
    if percent.fract() == 0.0 {
        format!("{percent:.0}")
    } else {
        format!("{percent:.1}")
    }
}
