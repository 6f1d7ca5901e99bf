//! ADS1115 16-bit ADC driver over I2C for the analog light and soil probes.
//!
//! Reads single-ended channels at PGA ±4.096 V, 128 SPS, single-shot mode.
//! One converter is shared by every probe; each probe holds an
//! [`AdcChannel`] handle for its input.

use std::cell::RefCell;
use std::rc::Rc;
use std::{thread, time::Duration};

use rppal::i2c::I2c;

use greenhouse_control::hw::AnalogInput;
use greenhouse_control::{Error, Result};

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS       write 1 to start single-shot conversion
//   [14:12] MUX      input multiplexer (channel selection)
//   [11:9]  PGA      programmable gain amplifier
//   [8]     MODE     0 = continuous, 1 = single-shot
//   [7:5]   DR       data rate
//   [4:2]   COMP_*   comparator mode, polarity, latch
//   [1:0]   COMP_QUE 11 = comparator off

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
/// DR=100 (128 SPS), COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// MUX values for single-ended reads (AINx vs GND).
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

const MAX_CHANNEL: u8 = 3;

/// Full-scale voltage of the configured PGA.
const FULL_SCALE_VOLTS: f64 = 4.096;

/// Conversion time at 128 SPS is ~7.8 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Bit 15 of the config register: conversion-ready flag when read.
const OS_READY_BIT: u16 = 1 << 15;

fn config_for_channel(channel: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[usize::from(channel)] << MUX_SHIFT)
}

/// Raw single-ended code to volts. Negative codes (bus noise) clamp to 0.
fn raw_to_volts(raw: i16) -> f64 {
    f64::from(raw.max(0)) * FULL_SCALE_VOLTS / 32768.0
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub struct Ads1115 {
    i2c: I2c,
}

impl Ads1115 {
    /// Open I2C bus 1 and address the ADS1115 at `addr`.
    pub fn new(addr: u16) -> anyhow::Result<Self> {
        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;
        tracing::info!(addr = format_args!("0x{addr:02x}"), "ads1115 initialised");
        Ok(Self { i2c })
    }

    /// Single-shot read on `channel`, returning the raw signed code.
    fn read_channel(&mut self, channel: u8) -> rppal::i2c::Result<i16> {
        let config_bytes = config_for_channel(channel).to_be_bytes();
        self.i2c.block_write(REG_CONFIG, &config_bytes)?;
        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }
}

/// One single-ended input of a shared converter.
pub struct AdcChannel {
    adc: Rc<RefCell<Ads1115>>,
    channel: u8,
}

impl AdcChannel {
    pub fn new(adc: Rc<RefCell<Ads1115>>, channel: u8) -> anyhow::Result<Self> {
        anyhow::ensure!(
            channel <= MAX_CHANNEL,
            "ADS1115 channel {channel} out of range (0-{MAX_CHANNEL})"
        );
        Ok(Self { adc, channel })
    }
}

impl AnalogInput for AdcChannel {
    fn read_volts(&mut self) -> Result<f64> {
        let raw = self
            .adc
            .borrow_mut()
            .read_channel(self.channel)
            .map_err(|e| Error::SensorRead(format!("ads1115 channel {}: {e}", self.channel)))?;
        Ok(raw_to_volts(raw))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // -- Config register construction -----------------------------------------

    #[test]
    fn config_register_per_channel() {
        assert_eq!(config_for_channel(0), 0xC383);
        assert_eq!(config_for_channel(1), 0xD383);
        assert_eq!(config_for_channel(2), 0xE383);
        assert_eq!(config_for_channel(3), 0xF383);
    }

    #[test]
    fn config_base_fields() {
        assert_eq!((CONFIG_BASE >> 15) & 1, 1, "OS starts a conversion");
        assert_eq!((CONFIG_BASE >> 9) & 0b111, 0b001, "PGA ±4.096 V");
        assert_eq!((CONFIG_BASE >> 8) & 1, 1, "single-shot");
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b100, "128 SPS");
    }

    // -- Conversion -----------------------------------------------------------

    #[test]
    fn raw_codes_scale_to_full_range() {
        assert_eq!(raw_to_volts(0), 0.0);
        assert_eq!(raw_to_volts(16384), 2.048);
        assert!((raw_to_volts(i16::MAX) - 4.096).abs() < 1e-3);
    }

    #[test]
    fn negative_codes_clamp_to_zero() {
        assert_eq!(raw_to_volts(-12), 0.0);
    }
}
