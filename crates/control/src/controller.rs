//! Threshold controllers. Each one watches a single sensor channel, runs one
//! reaction task per new reading, and drives the actuators it was given.
//!
//! Reactions for the same controller may overlap. They are serialized only
//! by the `busy` flag and the actuator's `available` lock, which is enough
//! because every task shares one cooperative executor.

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::actuator::{Actuator, PwmActuator};
use crate::observable::SubscriptionId;
use crate::roof::RoofOpener;
use crate::sensor::SensorReader;

/// Controller class, used as the key of the day/night policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    Moisture,
    Light,
    Temperature,
}

pub trait Controller {
    fn name(&self) -> &str;
    fn kind(&self) -> ControllerKind;
    fn enable(&self);
    /// Disabling a busy controller resets it.
    fn disable(&self);
    fn is_enabled(&self) -> bool;
    fn is_busy(&self) -> bool;

    fn set_state(&self, enabled: bool) {
        if enabled {
            self.enable();
        } else {
            self.disable();
        }
    }
}

#[derive(Default)]
struct Flags {
    enabled: Cell<bool>,
    busy: Cell<bool>,
    recent_hit: Cell<bool>,
}

impl Flags {
    fn enable(&self, name: &str) {
        if !self.enabled.replace(true) {
            info!(controller = name, "enabled");
        }
    }

    /// Returns whether the caller has to reset.
    fn disable(&self, name: &str) -> bool {
        if self.enabled.replace(false) {
            info!(controller = name, "disabled");
        }
        self.busy.get()
    }

    /// The actuator must be free or already held by us, and we must be
    /// enabled.
    fn requisites(&self, actuator_available: bool) -> bool {
        (actuator_available || self.busy.get()) && self.enabled.get()
    }
}

/// Spawn `react` as its own local task for every value published on the
/// reader's channel. The subscription holds only a weak handle.
fn schedule_reactions<C, F, Fut>(ctrl: &Rc<C>, reader: &SensorReader, react: F) -> SubscriptionId
where
    C: 'static,
    F: Fn(Rc<C>, f64) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    let weak = Rc::downgrade(ctrl);
    reader.channel().subscribe(move |&value| {
        if let Some(ctrl) = weak.upgrade() {
            tokio::task::spawn_local(react(ctrl, value));
        }
    })
}

// ---------------------------------------------------------------------------
// Soil moisture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MoistureSettings {
    pub low_threshold: f64,
    pub high_threshold: f64,
    pub keep_on_secs: u64,
    pub irrigation_delay_secs: u64,
    /// Upper bound on pump pulses per irrigation run. Unset means the run
    /// only ends once the soil reads above `high_threshold`.
    #[serde(default)]
    pub max_cycles: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrrigationState {
    Idle,
    /// Pump on for `keep_on_secs`.
    Irrigating,
    /// Pump off, letting water settle for `irrigation_delay_secs`.
    Cooldown,
}

/// Bang-bang irrigation with a settle delay between pump pulses.
pub struct MoistureController {
    flags: Flags,
    settings: MoistureSettings,
    reader: Rc<SensorReader>,
    pump: Rc<dyn Actuator>,
    state: Cell<IrrigationState>,
    generation: Cell<u64>,
    cycles: Cell<u32>,
}

impl MoistureController {
    pub fn new(
        reader: Rc<SensorReader>,
        pump: Rc<dyn Actuator>,
        settings: MoistureSettings,
    ) -> Rc<Self> {
        pump.power_off();
        let ctrl = Rc::new(Self {
            flags: Flags::default(),
            settings,
            reader: Rc::clone(&reader),
            pump,
            state: Cell::new(IrrigationState::Idle),
            generation: Cell::new(0),
            cycles: Cell::new(0),
        });
        schedule_reactions(&ctrl, &reader, |c, v| c.react(v));
        ctrl
    }

    pub fn state(&self) -> IrrigationState {
        self.state.get()
    }

    /// Pump pulses completed in the current (or last) irrigation run.
    pub fn cycles(&self) -> u32 {
        self.cycles.get()
    }

    fn in_band(&self, value: f64) -> bool {
        (self.settings.low_threshold..=self.settings.high_threshold).contains(&value)
    }

    fn wet_enough(&self, fallback: f64) -> bool {
        self.reader.value().unwrap_or(fallback) > self.settings.high_threshold
    }

    pub async fn react(self: Rc<Self>, value: f64) {
        if !self.flags.requisites(self.pump.available()) {
            return;
        }
        // A running cycle owns the pump and rechecks the live reading itself.
        if self.state.get() != IrrigationState::Idle {
            return;
        }
        if self.in_band(value) {
            self.reset();
            return;
        }
        if value < self.settings.low_threshold && !self.flags.recent_hit.get() {
            info!(
                moisture = value,
                low = self.settings.low_threshold,
                "moisture below threshold"
            );
            self.flags.recent_hit.set(true);
        }
        self.irrigate(value).await;
    }

    async fn irrigate(&self, trigger: f64) {
        if self.wet_enough(trigger) {
            self.reset();
            return;
        }

        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        self.flags.busy.set(true);
        self.cycles.set(0);
        let keep_on = Duration::from_secs(self.settings.keep_on_secs);
        let settle = Duration::from_secs(self.settings.irrigation_delay_secs);

        loop {
            if let Some(max) = self.settings.max_cycles {
                if self.cycles.get() >= max {
                    warn!(cycles = max, "irrigation stopped at cycle limit");
                    break;
                }
            }

            self.state.set(IrrigationState::Irrigating);
            self.pump.lock();
            self.pump.power_on();
            sleep(keep_on).await;
            if self.generation.get() != generation {
                return;
            }

            self.pump.power_off();
            self.state.set(IrrigationState::Cooldown);
            sleep(settle).await;
            if self.generation.get() != generation {
                return;
            }
            self.cycles.set(self.cycles.get() + 1);

            if self.wet_enough(trigger) {
                info!(cycles = self.cycles.get(), "soil moist again");
                break;
            }
            debug!(cycles = self.cycles.get(), "still dry, pulsing again");
        }
        self.reset();
    }

    /// Pump off, lock released, flags cleared, running cycle cancelled.
    pub fn reset(&self) {
        self.pump.power_off();
        self.pump.unlock();
        self.flags.recent_hit.set(false);
        self.flags.busy.set(false);
        self.state.set(IrrigationState::Idle);
        self.generation.set(self.generation.get() + 1);
    }
}

impl Controller for MoistureController {
    fn name(&self) -> &str {
        "moisture"
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Moisture
    }

    fn enable(&self) {
        self.flags.enable(self.name());
    }

    fn disable(&self) {
        if self.flags.disable(self.name()) {
            self.reset();
        }
    }

    fn is_enabled(&self) -> bool {
        self.flags.enabled.get()
    }

    fn is_busy(&self) -> bool {
        self.flags.busy.get()
    }
}

// ---------------------------------------------------------------------------
// Grow light
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LightSettings {
    pub threshold: f64,
}

/// Percentage of light to add for a reading below `threshold`.
pub fn dim_level(threshold: f64, reading: f64) -> f64 {
    (threshold - reading) / threshold * 100.0
}

/// Proportional grow-light control.
pub struct LightController {
    flags: Flags,
    settings: LightSettings,
    light: Rc<PwmActuator>,
}

impl LightController {
    pub fn new(reader: &SensorReader, light: Rc<PwmActuator>, settings: LightSettings) -> Rc<Self> {
        light.power_off();
        let ctrl = Rc::new(Self {
            flags: Flags::default(),
            settings,
            light,
        });
        schedule_reactions(&ctrl, reader, |c, v| async move { c.react(v) });
        ctrl
    }

    pub fn react(&self, value: f64) {
        if !self.flags.requisites(self.light.available()) {
            return;
        }
        if value >= self.settings.threshold {
            self.reset();
            return;
        }
        if !self.flags.recent_hit.get() {
            info!(
                light = value,
                threshold = self.settings.threshold,
                "light below threshold"
            );
            self.flags.busy.set(true);
            self.light.lock();
            self.flags.recent_hit.set(true);
        }
        let level = dim_level(self.settings.threshold, value);
        if let Err(e) = self.light.set_percentage(level) {
            warn!(level, "grow light rejected level: {e}");
        }
    }

    pub fn reset(&self) {
        self.light.power_off();
        self.light.unlock();
        self.flags.recent_hit.set(false);
        self.flags.busy.set(false);
    }
}

impl Controller for LightController {
    fn name(&self) -> &str {
        "light"
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Light
    }

    fn enable(&self) {
        self.flags.enable(self.name());
    }

    fn disable(&self) {
        if self.flags.disable(self.name()) {
            self.reset();
        }
    }

    fn is_enabled(&self) -> bool {
        self.flags.enabled.get()
    }

    fn is_busy(&self) -> bool {
        self.flags.busy.get()
    }
}

// ---------------------------------------------------------------------------
// Temperature
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TemperatureSettings {
    pub min_threshold: f64,
    pub max_threshold: f64,
    pub hysteresis: f64,
    /// Seconds between samples while acting, to let the air catch up.
    pub inertia_secs: u64,
}

/// Heater output law, given how many degrees the air is below target.
/// `None` keeps the heater off.
pub trait HeatingLaw {
    fn heater_percent(&self, deficit: f64) -> Option<f64>;
}

/// No heating curve has been defined for this greenhouse: the heater is
/// never powered and warming relies on keeping the vent shut.
pub struct HeatingDisabled;

impl HeatingLaw for HeatingDisabled {
    fn heater_percent(&self, _deficit: f64) -> Option<f64> {
        None
    }
}

/// Two-sided hysteresis: close the vent (and heat, if a law is set) when
/// cold; open the vent and withhold heat when hot.
pub struct TemperatureController {
    flags: Flags,
    settings: TemperatureSettings,
    reader: Rc<SensorReader>,
    vent: Rc<RoofOpener>,
    heater: Option<Rc<PwmActuator>>,
    law: Box<dyn HeatingLaw>,
    waiting: Cell<bool>,
    generation: Cell<u64>,
}

impl TemperatureController {
    pub fn new(
        reader: Rc<SensorReader>,
        vent: Rc<RoofOpener>,
        heater: Option<Rc<PwmActuator>>,
        law: Box<dyn HeatingLaw>,
        settings: TemperatureSettings,
    ) -> Rc<Self> {
        let ctrl = Rc::new(Self {
            flags: Flags::default(),
            settings,
            reader: Rc::clone(&reader),
            vent,
            heater,
            law,
            waiting: Cell::new(false),
            generation: Cell::new(0),
        });
        schedule_reactions(&ctrl, &reader, |c, v| c.react(v));
        ctrl
    }

    /// True while sleeping out the thermal inertia between samples.
    pub fn is_waiting(&self) -> bool {
        self.waiting.get()
    }

    fn live(&self, fallback: f64) -> f64 {
        self.reader.value().unwrap_or(fallback)
    }

    pub async fn react(self: Rc<Self>, value: f64) {
        if !self.flags.requisites(self.vent.available()) {
            return;
        }
        if self.flags.busy.get() || self.waiting.get() || self.vent.is_moving() {
            return;
        }
        if value < self.settings.min_threshold {
            info!(
                temperature = value,
                min = self.settings.min_threshold,
                "too cold"
            );
            self.flags.recent_hit.set(true);
            self.heat(value).await;
        } else if value > self.settings.max_threshold {
            info!(
                temperature = value,
                max = self.settings.max_threshold,
                "too hot"
            );
            self.flags.recent_hit.set(true);
            self.cool(value).await;
        }
    }

    fn begin(&self) -> u64 {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        self.flags.busy.set(true);
        self.vent.lock();
        if let Some(heater) = &self.heater {
            heater.lock();
        }
        generation
    }

    /// Sleep out the inertia. Returns false if a reset happened meanwhile.
    async fn settle(&self, generation: u64) -> bool {
        self.waiting.set(true);
        sleep(Duration::from_secs(self.settings.inertia_secs)).await;
        if self.generation.get() != generation {
            return false;
        }
        self.waiting.set(false);
        true
    }

    async fn heat(&self, trigger: f64) {
        let generation = self.begin();
        let target = self.settings.min_threshold + self.settings.hysteresis;

        loop {
            let temp = self.live(trigger);
            if temp >= target {
                break;
            }
            if !self.vent.close().await {
                warn!("vent did not confirm closed");
            }
            if self.generation.get() != generation {
                return;
            }
            if let Some(heater) = &self.heater {
                let applied = match self.law.heater_percent(target - temp) {
                    Some(p) => heater.set_percentage(p.clamp(0.0, 100.0)),
                    None => {
                        heater.power_off();
                        Ok(())
                    }
                };
                if let Err(e) = applied {
                    warn!("heater rejected level: {e}");
                }
            }
            if !self.settle(generation).await {
                return;
            }
        }
        info!(target, "warm enough");
        self.reset();
    }

    async fn cool(&self, trigger: f64) {
        let generation = self.begin();
        let target = self.settings.max_threshold - self.settings.hysteresis;

        loop {
            let temp = self.live(trigger);
            if temp <= target {
                break;
            }
            if let Some(heater) = &self.heater {
                heater.power_off();
            }
            if !self.vent.open().await {
                warn!("vent did not confirm open");
            }
            if self.generation.get() != generation {
                return;
            }
            if !self.settle(generation).await {
                return;
            }
        }
        info!(target, "cool enough");
        self.reset();
    }

    /// Heater off, locks released, flags cleared. The vent stays where it is.
    pub fn reset(&self) {
        if let Some(heater) = &self.heater {
            heater.power_off();
            heater.unlock();
        }
        self.vent.unlock();
        self.flags.recent_hit.set(false);
        self.flags.busy.set(false);
        self.waiting.set(false);
        self.generation.set(self.generation.get() + 1);
    }
}

impl Controller for TemperatureController {
    fn name(&self) -> &str {
        "temperature"
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Temperature
    }

    fn enable(&self) {
        self.flags.enable(self.name());
    }

    fn disable(&self) {
        if self.flags.disable(self.name()) {
            self.reset();
        }
    }

    fn is_enabled(&self) -> bool {
        self.flags.enabled.get()
    }

    fn is_busy(&self) -> bool {
        self.flags.busy.get()
    }
}
