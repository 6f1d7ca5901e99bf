//! Raspberry Pi backend via `rppal`: relay and LED outputs, software PWM,
//! interrupt-armed limit switches, an A4988-style stepper driver, the
//! ADS1115 and the DS18B20.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};

use greenhouse_control::hw::{DigitalInput, DigitalOutput, Direction, PwmOutput, StepperDriver};
use greenhouse_control::Error;

use crate::adc::{AdcChannel, Ads1115};
use crate::config::Config;
use crate::hardware::{Hardware, VentHardware};
use crate::w1::{Ds18b20, DEVICES_DIR};

/// Default I2C address of the ADS1115 (ADDR pin tied to GND).
const ADS1115_ADDR: u16 = 0x48;

/// Relay or LED output.
pub struct Relay {
    pin: OutputPin,
    active_low: bool,
}

impl Relay {
    fn new(gpio: &Gpio, pin: u8, active_low: bool) -> Result<Self> {
        let pin = gpio
            .get(pin)
            .with_context(|| format!("gpio {pin} unavailable"))?
            .into_output();
        let mut relay = Self { pin, active_low };
        // Fail-safe: OFF at startup.
        relay.set_level(false);
        Ok(relay)
    }
}

impl DigitalOutput for Relay {
    fn set_level(&mut self, high: bool) {
        if high != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }
}

/// Software PWM on any GPIO.
pub struct SoftPwm {
    pin: OutputPin,
    frequency: f64,
}

impl SoftPwm {
    fn new(gpio: &Gpio, pin: u8, frequency: f64) -> Result<Self> {
        let pin = gpio
            .get(pin)
            .with_context(|| format!("gpio {pin} unavailable"))?
            .into_output_low();
        Ok(Self { pin, frequency })
    }
}

impl PwmOutput for SoftPwm {
    fn set_duty(&mut self, duty: u16, max: u16) -> greenhouse_control::Result<()> {
        let ratio = f64::from(duty) / f64::from(max.max(1));
        self.pin
            .set_pwm_frequency(self.frequency, ratio)
            .map_err(|e| Error::Hardware(format!("pwm on gpio {}: {e}", self.pin.pin())))
    }
}

/// Limit switch wired to pull the input high when pressed.
pub struct Switch {
    pin: InputPin,
}

impl Switch {
    fn new(gpio: &Gpio, pin: u8) -> Result<Self> {
        let pin = gpio
            .get(pin)
            .with_context(|| format!("gpio {pin} unavailable"))?
            .into_input_pulldown();
        Ok(Self { pin })
    }
}

impl DigitalInput for Switch {
    fn is_high(&self) -> bool {
        self.pin.is_high()
    }

    fn on_rising(
        &mut self,
        mut handler: Box<dyn FnMut() + Send + 'static>,
    ) -> greenhouse_control::Result<()> {
        self.pin
            .set_async_interrupt(Trigger::RisingEdge, move |_level| handler())
            .map_err(|e| Error::Hardware(format!("interrupt on gpio {}: {e}", self.pin.pin())))
    }
}

/// A4988 step/dir driver. SLEEP is active low; the brake pin drives a
/// holding brake that engages when high.
pub struct A4988 {
    step: OutputPin,
    direction: OutputPin,
    sleep: OutputPin,
    brake: OutputPin,
}

impl StepperDriver for A4988 {
    fn set_brake(&mut self, engaged: bool) {
        if engaged {
            self.brake.set_high();
        } else {
            self.brake.set_low();
        }
    }

    fn set_sleep(&mut self, asleep: bool) {
        if asleep {
            self.sleep.set_low();
        } else {
            self.sleep.set_high();
        }
    }

    fn set_direction(&mut self, direction: Direction) {
        match direction {
            Direction::Open => self.direction.set_high(),
            Direction::Close => self.direction.set_low(),
        }
    }

    fn set_step(&mut self, high: bool) {
        if high {
            self.step.set_high();
        } else {
            self.step.set_low();
        }
    }
}

pub async fn open(cfg: &Config) -> Result<Hardware> {
    let gpio = Gpio::new().context("failed to open GPIO")?;
    let a = &cfg.actuators;

    let adc = Rc::new(RefCell::new(Ads1115::new(ADS1115_ADDR)?));
    let light = AdcChannel::new(Rc::clone(&adc), cfg.sensors.light.channel)?;
    let moisture = AdcChannel::new(Rc::clone(&adc), cfg.sensors.moisture.channel)?;

    let probe = &cfg.sensors.temperature;
    let (attempts, delay) = (
        probe.probe_attempts,
        Duration::from_millis(probe.probe_delay_ms),
    );
    let thermometer = tokio::task::spawn_blocking(move || {
        Ds18b20::discover(Path::new(DEVICES_DIR), attempts, delay)
    })
    .await
    .context("probe discovery task failed")?
    .context("temperature probe")?
    .spawn_sampler(Duration::from_millis(probe.poll_ms))
    .context("temperature probe")?;

    let heater: Option<Box<dyn PwmOutput>> = match a.heater_pin {
        Some(pin) => Some(Box::new(SoftPwm::new(&gpio, pin, a.pwm_frequency_hz)?)),
        None => None,
    };
    let heartbeat: Option<Box<dyn DigitalOutput>> = match a.heartbeat_pin {
        Some(pin) => Some(Box::new(Relay::new(&gpio, pin, false)?)),
        None => None,
    };
    let vent = match &a.vent {
        Some(v) => {
            let out = |pin: u8| -> Result<OutputPin> {
                Ok(gpio
                    .get(pin)
                    .with_context(|| format!("gpio {pin} unavailable"))?
                    .into_output_low())
            };
            Some(VentHardware {
                driver: Box::new(A4988 {
                    step: out(v.step_pin)?,
                    direction: out(v.direction_pin)?,
                    sleep: out(v.sleep_pin)?,
                    brake: out(v.brake_pin)?,
                }),
                open_switch: Box::new(Switch::new(&gpio, v.open_switch_pin)?),
                close_switch: Box::new(Switch::new(&gpio, v.close_switch_pin)?),
            })
        }
        None => None,
    };

    tracing::info!(
        pump = a.pump_pin,
        light = a.light_pin,
        vent = a.vent.is_some(),
        "gpio backend ready"
    );

    Ok(Hardware {
        light: Box::new(light),
        moisture: Box::new(moisture),
        temperature: Box::new(thermometer),
        pump: Box::new(Relay::new(&gpio, a.pump_pin, a.pump_active_low)?),
        grow_light: Box::new(SoftPwm::new(&gpio, a.light_pin, a.pwm_frequency_hz)?),
        heater,
        heartbeat,
        vent,
    })
}
