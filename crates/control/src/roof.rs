//! Stepper-driven roof vent with limit-switch position sensing.
//!
//! Both limit switches are armed with the vent's [`AbortSignal`]: a rising
//! edge on either one stops an in-progress rotation before its next step.
//! Rotations deliberately overshoot the travel length so the switch, not a
//! step count, decides where the vent stops; the step count only bounds the
//! runtime when a switch never fires.

use std::cell::{Cell, RefCell};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::actuator::{Actuator, ActuatorStatus};
use crate::hw::{AbortSignal, DigitalInput, Direction, StepperDriver};
use crate::Result;

/// A limit switch (endstop).
pub struct EndStop {
    name: String,
    input: RefCell<Box<dyn DigitalInput>>,
}

impl EndStop {
    pub fn new(name: impl Into<String>, input: Box<dyn DigitalInput>) -> Self {
        Self {
            name: name.into(),
            input: RefCell::new(input),
        }
    }

    pub fn active(&self) -> bool {
        self.input.borrow().is_high()
    }

    /// Raise `signal` from the interrupt handler on every rising edge.
    pub fn arm(&self, signal: AbortSignal) -> Result<()> {
        self.input
            .borrow_mut()
            .on_rising(Box::new(move || signal.raise()))?;
        debug!(end_stop = %self.name, "limit switch armed");
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoofSettings {
    /// High time and low time of each step pulse.
    #[serde(default = "default_step_pulse_ms")]
    pub step_pulse_ms: u64,
    /// Steps for one full end-to-end travel.
    #[serde(default = "default_max_travel_steps")]
    pub max_travel_steps: u32,
    /// Pause after setting direction before the first step.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Steps per burst during forced closing.
    #[serde(default = "default_burst_steps")]
    pub burst_steps: u32,
}

fn default_step_pulse_ms() -> u64 {
    2
}

fn default_max_travel_steps() -> u32 {
    200
}

fn default_settle_ms() -> u64 {
    5
}

fn default_burst_steps() -> u32 {
    50
}

impl Default for RoofSettings {
    fn default() -> Self {
        Self {
            step_pulse_ms: default_step_pulse_ms(),
            max_travel_steps: default_max_travel_steps(),
            settle_ms: default_settle_ms(),
            burst_steps: default_burst_steps(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rotation {
    Completed,
    Aborted,
}

pub struct RoofOpener {
    name: String,
    status: ActuatorStatus,
    driver: RefCell<Box<dyn StepperDriver>>,
    open_switch: EndStop,
    close_switch: EndStop,
    abort: AbortSignal,
    moving: Cell<bool>,
    settings: RoofSettings,
}

impl RoofOpener {
    /// Build the vent and arm both limit switches with its abort signal.
    pub fn new(
        name: impl Into<String>,
        driver: Box<dyn StepperDriver>,
        open_switch: EndStop,
        close_switch: EndStop,
        settings: RoofSettings,
    ) -> Result<Self> {
        let abort = AbortSignal::new();
        open_switch.arm(abort.clone())?;
        close_switch.arm(abort.clone())?;

        let vent = Self {
            name: name.into(),
            status: ActuatorStatus::new(),
            driver: RefCell::new(driver),
            open_switch,
            close_switch,
            abort,
            moving: Cell::new(false),
            settings,
        };
        vent.power_off();
        Ok(vent)
    }

    pub fn opened(&self) -> bool {
        self.open_switch.active()
    }

    pub fn closed(&self) -> bool {
        self.close_switch.active()
    }

    /// Exactly one of the two switches is asserted.
    pub fn valid_position(&self) -> bool {
        self.opened() ^ self.closed()
    }

    pub fn is_moving(&self) -> bool {
        self.moving.get()
    }

    pub async fn open(&self) -> bool {
        if self.opened() && !self.closed() {
            return true;
        }
        info!(actuator = %self.name, "opening");
        let ok = self.movement(Direction::Open, Self::opened).await;
        self.status.set_info(position_label(self));
        ok
    }

    pub async fn close(&self) -> bool {
        if self.closed() && !self.opened() {
            return true;
        }
        info!(actuator = %self.name, "closing");
        let ok = self.movement(Direction::Close, Self::closed).await;
        self.status.set_info(position_label(self));
        ok
    }

    /// Rotate toward `direction` until a limit switch stops the motor or
    /// the overshoot budget runs out. Returns whether the vent ended in a
    /// valid position that also satisfies `final_check`.
    pub async fn movement(&self, direction: Direction, final_check: fn(&Self) -> bool) -> bool {
        if !self.valid_position() && !self.forced_close().await {
            return false;
        }

        self.moving.set(true);
        self.abort.clear();
        let steps = self.settings.max_travel_steps * 3 / 2;
        let outcome = self.rotate(steps, direction, true).await;
        self.moving.set(false);

        debug!(actuator = %self.name, ?direction, ?outcome, "movement finished");
        self.valid_position() && final_check(self)
    }

    /// Recovery path: drive toward CLOSE in short bursts until the close
    /// switch asserts. Ignores the abort signal. Gives up after enough
    /// bursts to cover twice the travel length.
    pub async fn forced_close(&self) -> bool {
        warn!(actuator = %self.name, "position unknown, closing forcibly");
        self.moving.set(true);

        let burst = self.settings.burst_steps.max(1);
        let max_bursts = self.settings.max_travel_steps * 2 / burst + 1;
        let mut bursts = 0;
        while !self.closed() && bursts < max_bursts {
            self.rotate(burst, Direction::Close, false).await;
            bursts += 1;
        }

        self.moving.set(false);
        let closed = self.closed();
        if !closed {
            error!(
                actuator = %self.name,
                bursts,
                "forced close gave up, close switch never asserted"
            );
        }
        closed
    }

    async fn rotate(&self, steps: u32, direction: Direction, abortable: bool) -> Rotation {
        let pulse = Duration::from_millis(self.settings.step_pulse_ms);
        {
            let mut driver = self.driver.borrow_mut();
            driver.set_sleep(false);
            driver.set_brake(false);
            driver.set_direction(direction);
        }
        sleep(Duration::from_millis(self.settings.settle_ms)).await;

        let mut outcome = Rotation::Completed;
        for _ in 0..steps {
            if abortable && self.abort.is_raised() {
                outcome = Rotation::Aborted;
                break;
            }
            self.driver.borrow_mut().set_step(true);
            sleep(pulse).await;
            self.driver.borrow_mut().set_step(false);
            sleep(pulse).await;
        }

        self.driver.borrow_mut().set_brake(true);
        outcome
    }
}

fn position_label(vent: &RoofOpener) -> &'static str {
    match (vent.opened(), vent.closed()) {
        (true, false) => "open",
        (false, true) => "closed",
        _ => "unknown",
    }
}

impl Actuator for RoofOpener {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> &ActuatorStatus {
        &self.status
    }

    /// Wake the driver. Motion only happens through `open`/`close`.
    fn power_on(&self) {
        let mut driver = self.driver.borrow_mut();
        driver.set_sleep(false);
        driver.set_brake(false);
    }

    fn power_off(&self) {
        let mut driver = self.driver.borrow_mut();
        driver.set_brake(true);
        driver.set_sleep(true);
    }
}
