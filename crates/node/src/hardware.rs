//! The set of hardware seams the node wires into the control core, and the
//! backend that provides them.

use std::rc::Rc;

use anyhow::Result;

use greenhouse_control::daynight::Clock;
use greenhouse_control::hw::{
    AnalogInput, DigitalInput, DigitalOutput, PwmOutput, SensorInput, StepperDriver,
};

use crate::config::Config;

#[cfg(not(any(feature = "sim", feature = "gpio")))]
compile_error!("enable the `sim` or the `gpio` feature");

pub struct VentHardware {
    pub driver: Box<dyn StepperDriver>,
    pub open_switch: Box<dyn DigitalInput>,
    pub close_switch: Box<dyn DigitalInput>,
}

pub struct Hardware {
    pub light: Box<dyn AnalogInput>,
    pub moisture: Box<dyn AnalogInput>,
    pub temperature: Box<dyn SensorInput>,
    pub pump: Box<dyn DigitalOutput>,
    pub grow_light: Box<dyn PwmOutput>,
    pub heater: Option<Box<dyn PwmOutput>>,
    pub heartbeat: Option<Box<dyn DigitalOutput>>,
    pub vent: Option<VentHardware>,
}

/// Real GPIO wins when both backends are compiled in.
#[cfg(feature = "gpio")]
pub async fn open(cfg: &Config, _clock: Rc<dyn Clock>) -> Result<Hardware> {
    crate::gpio::open(cfg).await
}

#[cfg(all(feature = "sim", not(feature = "gpio")))]
pub async fn open(cfg: &Config, clock: Rc<dyn Clock>) -> Result<Hardware> {
    Ok(crate::sim::open(cfg, clock))
}
