//! Simulated greenhouse for running the node without hardware.
//!
//! A single shared world models:
//! - Soil that dries slowly and soaks up water while the pump runs
//! - Daylight following the time of day, plus the grow light
//! - Air temperature pulled toward a day/night outside curve, warmed by the
//!   heater and cooled faster while the vent is open
//! - A stepper vent that moves one unit per step and fires its limit-switch
//!   interrupts at either end
//!
//! The world advances by elapsed (tokio) time whenever a sensor is read.

use std::cell::RefCell;
use std::f64::consts::PI;
use std::rc::Rc;

use tokio::time::Instant;
use tracing::debug;

use greenhouse_control::daynight::Clock;
use greenhouse_control::hw::{
    AnalogInput, DigitalInput, DigitalOutput, Direction, PwmOutput, SensorInput, StepperDriver,
};
use greenhouse_control::Result;

use crate::config::Config;
use crate::hardware::{Hardware, VentHardware};

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// World model
// ---------------------------------------------------------------------------

/// Moisture gained per second of pumping (%).
const PUMP_RATE: f64 = 0.8;
/// Moisture lost per second to evaporation (%).
const DRY_RATE: f64 = 0.01;
/// Light added by the grow light at full duty (%).
const GROW_LIGHT_GAIN: f64 = 45.0;
/// Fraction of the outside difference closed per second, vent shut.
const LEAK_RATE: f64 = 0.002;
/// Extra exchange with the outside air when the vent is fully open.
const VENT_GAIN: f64 = 4.0;
/// Warming per second at full heater duty (°C).
const HEATER_RATE: f64 = 0.02;

type Handler = Box<dyn FnMut() + Send + 'static>;

pub struct World {
    clock: Rc<dyn Clock>,
    last: Instant,
    moisture: f64,
    temperature: f64,
    pump_on: bool,
    grow_light: f64,
    heater: f64,
    vent_position: u32,
    vent_travel: u32,
    vent_direction: Direction,
    vent_asleep: bool,
    open_handler: Option<Handler>,
    close_handler: Option<Handler>,
}

impl World {
    pub fn new(clock: Rc<dyn Clock>, vent_travel: u32) -> Self {
        Self {
            clock,
            last: Instant::now(),
            moisture: 45.0,
            temperature: 21.0,
            pump_on: false,
            grow_light: 0.0,
            heater: 0.0,
            vent_position: 0,
            vent_travel,
            vent_direction: Direction::Close,
            vent_asleep: true,
            open_handler: None,
            close_handler: None,
        }
    }

    /// Hours since midnight on the simulation clock.
    fn hour(&self) -> f64 {
        let t = self.clock.time_of_day();
        f64::from(t.hour()) + f64::from(t.minute()) / 60.0
    }

    /// Natural light in %, zero outside 06:00-20:00.
    fn daylight(&self) -> f64 {
        let h = self.hour();
        if !(6.0..20.0).contains(&h) {
            return 0.0;
        }
        80.0 * (PI * (h - 6.0) / 14.0).sin()
    }

    /// Outside air: 12 °C before dawn, 24 °C mid-afternoon.
    fn outside_temperature(&self) -> f64 {
        18.0 + 6.0 * (2.0 * PI * (self.hour() - 9.0) / 24.0).sin()
    }

    fn vent_open_fraction(&self) -> f64 {
        f64::from(self.vent_position) / f64::from(self.vent_travel.max(1))
    }

    fn advance(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        if dt <= 0.0 {
            return;
        }

        let soak = if self.pump_on { PUMP_RATE } else { -DRY_RATE };
        self.moisture = (self.moisture + soak * dt).clamp(0.0, 100.0);

        let exchange = LEAK_RATE * (1.0 + VENT_GAIN * self.vent_open_fraction());
        let pull = (self.outside_temperature() - self.temperature) * (exchange * dt).min(1.0);
        self.temperature += pull + HEATER_RATE * self.heater * dt;
    }

    fn light(&self) -> f64 {
        (self.daylight() + GROW_LIGHT_GAIN * self.grow_light).clamp(0.0, 100.0)
    }

    fn step(&mut self) {
        if self.vent_asleep {
            return;
        }
        let before = self.vent_position;
        self.vent_position = match self.vent_direction {
            Direction::Open => (before + 1).min(self.vent_travel),
            Direction::Close => before.saturating_sub(1),
        };
        if before < self.vent_travel && self.vent_position == self.vent_travel {
            debug!("sim vent reached open stop");
            if let Some(h) = self.open_handler.as_mut() {
                h();
            }
        }
        if before > 0 && self.vent_position == 0 {
            debug!("sim vent reached closed stop");
            if let Some(h) = self.close_handler.as_mut() {
                h();
            }
        }
    }
}

pub type SharedWorld = Rc<RefCell<World>>;

// ---------------------------------------------------------------------------
// Hardware seams
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Quantity {
    Light,
    Moisture,
}

/// Analog probe: light reads higher with more light, moisture reads higher
/// when the soil is drier.
pub struct SimProbe {
    world: SharedWorld,
    quantity: Quantity,
    max_voltage: f64,
}

impl AnalogInput for SimProbe {
    fn read_volts(&mut self) -> Result<f64> {
        let mut w = self.world.borrow_mut();
        w.advance();
        let percent = match self.quantity {
            Quantity::Light => w.light(),
            Quantity::Moisture => 100.0 - w.moisture,
        };
        let volts = percent / 100.0 * self.max_voltage + gaussian(0.0, 0.005);
        Ok(volts.max(0.0))
    }
}

pub struct SimThermometer(SharedWorld);

impl SensorInput for SimThermometer {
    fn read(&mut self) -> Result<f64> {
        let mut w = self.0.borrow_mut();
        w.advance();
        Ok(w.temperature + gaussian(0.0, 0.05))
    }
}

pub struct SimPump(SharedWorld);

impl DigitalOutput for SimPump {
    fn set_level(&mut self, high: bool) {
        let mut w = self.0.borrow_mut();
        w.advance();
        w.pump_on = high;
    }
}

#[derive(Clone, Copy)]
enum PwmTarget {
    GrowLight,
    Heater,
}

pub struct SimPwm(SharedWorld, PwmTarget);

impl PwmOutput for SimPwm {
    fn set_duty(&mut self, duty: u16, max: u16) -> Result<()> {
        let mut w = self.0.borrow_mut();
        w.advance();
        let level = f64::from(duty) / f64::from(max.max(1));
        match self.1 {
            PwmTarget::GrowLight => w.grow_light = level,
            PwmTarget::Heater => w.heater = level,
        }
        Ok(())
    }
}

/// Heartbeat LED: only logs.
pub struct SimLed;

impl DigitalOutput for SimLed {
    fn set_level(&mut self, high: bool) {
        debug!(high, "heartbeat");
    }
}

pub struct SimStepper(SharedWorld);

impl StepperDriver for SimStepper {
    fn set_brake(&mut self, _engaged: bool) {}

    fn set_sleep(&mut self, asleep: bool) {
        self.0.borrow_mut().vent_asleep = asleep;
    }

    fn set_direction(&mut self, direction: Direction) {
        self.0.borrow_mut().vent_direction = direction;
    }

    fn set_step(&mut self, high: bool) {
        if high {
            self.0.borrow_mut().step();
        }
    }
}

#[derive(Clone, Copy)]
enum Stop {
    Open,
    Closed,
}

pub struct SimSwitch(SharedWorld, Stop);

impl DigitalInput for SimSwitch {
    fn is_high(&self) -> bool {
        let w = self.0.borrow();
        match self.1 {
            Stop::Open => w.vent_position == w.vent_travel,
            Stop::Closed => w.vent_position == 0,
        }
    }

    fn on_rising(&mut self, handler: Handler) -> Result<()> {
        let mut w = self.0.borrow_mut();
        match self.1 {
            Stop::Open => w.open_handler = Some(handler),
            Stop::Closed => w.close_handler = Some(handler),
        }
        Ok(())
    }
}

/// Build every hardware seam against one shared world.
pub fn open(cfg: &Config, clock: Rc<dyn Clock>) -> Hardware {
    let travel = cfg
        .actuators
        .vent
        .as_ref()
        .map_or(200, |v| v.motion.max_travel_steps);
    let world: SharedWorld = Rc::new(RefCell::new(World::new(clock, travel)));
    tracing::info!(vent_travel = travel, "simulated greenhouse ready");

    Hardware {
        light: Box::new(SimProbe {
            world: Rc::clone(&world),
            quantity: Quantity::Light,
            max_voltage: cfg.sensors.light.max_voltage,
        }),
        moisture: Box::new(SimProbe {
            world: Rc::clone(&world),
            quantity: Quantity::Moisture,
            max_voltage: cfg.sensors.moisture.max_voltage,
        }),
        temperature: Box::new(SimThermometer(Rc::clone(&world))),
        pump: Box::new(SimPump(Rc::clone(&world))),
        grow_light: Box::new(SimPwm(Rc::clone(&world), PwmTarget::GrowLight)),
        heater: cfg
            .actuators
            .heater_pin
            .map(|_| Box::new(SimPwm(Rc::clone(&world), PwmTarget::Heater)) as Box<dyn PwmOutput>),
        heartbeat: cfg
            .actuators
            .heartbeat_pin
            .map(|_| Box::new(SimLed) as Box<dyn DigitalOutput>),
        vent: cfg.actuators.vent.as_ref().map(|_| VentHardware {
            driver: Box::new(SimStepper(Rc::clone(&world))),
            open_switch: Box::new(SimSwitch(Rc::clone(&world), Stop::Open)),
            close_switch: Box::new(SimSwitch(Rc::clone(&world), Stop::Closed)),
        }),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
