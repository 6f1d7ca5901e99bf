//! Sensor readers: poll a hardware input, calibrate, smooth, round, and
//! publish the result on a notification channel.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::filter::MovingAverage;
use crate::hw::{AnalogInput, SensorInput};
use crate::observable::Observable;
use crate::{Error, Result};

/// Per-reader tuning shared by every sensor kind.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaderSettings {
    /// Moving-average window length.
    pub history_length: usize,
    /// Decimal places kept after filtering.
    pub decimals: u32,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

fn default_poll_ms() -> u64 {
    500
}

/// Voltage → percentage mapping for analog probes.
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    /// Voltage that corresponds to 100 %.
    pub max_voltage: f64,
    /// Report `100 − percent` (soil probes read higher when drier).
    pub invert: bool,
}

impl Calibration {
    pub fn percent(&self, volts: f64) -> f64 {
        let pct = (volts / self.max_voltage * 100.0).clamp(0.0, 100.0);
        if self.invert {
            100.0 - pct
        } else {
            pct
        }
    }
}

enum Source {
    Analog {
        input: Box<dyn AnalogInput>,
        calibration: Calibration,
    },
    Direct(Box<dyn SensorInput>),
}

impl Source {
    fn sample(&mut self) -> Result<f64> {
        match self {
            Source::Analog { input, calibration } => {
                input.read_volts().map(|v| calibration.percent(v))
            }
            Source::Direct(input) => input.read(),
        }
    }
}

pub struct SensorReader {
    name: String,
    source: RefCell<Source>,
    filter: RefCell<MovingAverage>,
    decimals: u32,
    poll_interval: Duration,
    value: Observable<f64>,
}

impl SensorReader {
    /// Analog probe read through an ADC channel.
    pub fn analog(
        name: impl Into<String>,
        input: Box<dyn AnalogInput>,
        calibration: Calibration,
        settings: &ReaderSettings,
    ) -> Self {
        Self::build(name.into(), Source::Analog { input, calibration }, settings)
    }

    /// Probe that already reports the physical quantity.
    pub fn direct(
        name: impl Into<String>,
        input: Box<dyn SensorInput>,
        settings: &ReaderSettings,
    ) -> Self {
        Self::build(name.into(), Source::Direct(input), settings)
    }

    fn build(name: String, source: Source, settings: &ReaderSettings) -> Self {
        Self {
            name,
            source: RefCell::new(source),
            filter: RefCell::new(MovingAverage::new(settings.history_length)),
            decimals: settings.decimals,
            poll_interval: Duration::from_millis(settings.poll_ms),
            value: Observable::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current filtered value, `None` before the first good sample.
    pub fn value(&self) -> Option<f64> {
        self.value.get()
    }

    pub fn channel(&self) -> &Observable<f64> {
        &self.value
    }

    /// Take one sample and publish the filtered result. A failed read keeps
    /// the previous value and is only logged.
    pub fn poll_once(&self) -> Option<f64> {
        let sample = match self.source.borrow_mut().sample() {
            Ok(s) => s,
            Err(e) => {
                warn!(sensor = %self.name, "read failed, keeping last value: {e}");
                return self.value();
            }
        };

        let avg = {
            let mut filter = self.filter.borrow_mut();
            filter.push(sample);
            filter.average()?
        };
        let rounded = round_to(avg, self.decimals);
        if self.value.set(rounded) {
            debug!(sensor = %self.name, sample, value = rounded, "value changed");
        }
        Some(rounded)
    }

    /// Poll forever at the configured interval.
    pub async fn run(self: Rc<Self>) {
        loop {
            self.poll_once();
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Startup probe discovery: call `probe` up to `attempts` times, sleeping
/// `delay` between tries. Running out of attempts is a fatal startup error.
pub fn discover<T>(
    attempts: u32,
    delay: Duration,
    mut probe: impl FnMut() -> Option<T>,
) -> Result<T> {
    for attempt in 1..=attempts {
        if let Some(found) = probe() {
            return Ok(found);
        }
        warn!(attempt, attempts, "sensor probe not found yet");
        if attempt < attempts {
            std::thread::sleep(delay);
        }
    }
    Err(Error::ProbeNotFound { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::VecDeque;

    /// Replays a fixed script of voltages; `None` entries fail the read.
    struct ScriptedVolts(VecDeque<Option<f64>>);

    impl AnalogInput for ScriptedVolts {
        fn read_volts(&mut self) -> Result<f64> {
            self.0
                .pop_front()
                .flatten()
                .ok_or_else(|| Error::SensorRead("scripted failure".into()))
        }
    }

    fn settings(history_length: usize, decimals: u32) -> ReaderSettings {
        ReaderSettings {
            history_length,
            decimals,
            poll_ms: 500,
        }
    }

    fn reader(script: Vec<Option<f64>>, invert: bool, history: usize) -> SensorReader {
        SensorReader::analog(
            "probe",
            Box::new(ScriptedVolts(script.into())),
            Calibration {
                max_voltage: 2.0,
                invert,
            },
            &settings(history, 1),
        )
    }

    #[test]
    fn calibration_scales_and_clamps() {
        let cal = Calibration {
            max_voltage: 2.0,
            invert: false,
        };
        assert_eq!(cal.percent(1.0), 50.0);
        assert_eq!(cal.percent(3.3), 100.0);
        assert_eq!(cal.percent(-0.1), 0.0);
    }

    #[test]
    fn moisture_calibration_is_inverted() {
        let cal = Calibration {
            max_voltage: 2.0,
            invert: true,
        };
        // Dry soil reads high voltage → low moisture.
        assert_eq!(cal.percent(1.5), 25.0);
    }

    #[test]
    fn poll_applies_filter_and_rounding() {
        let r = reader(vec![Some(1.0), Some(0.5), Some(0.25)], false, 2);
        assert_eq!(r.poll_once(), Some(50.0));
        assert_eq!(r.poll_once(), Some(37.5));
        // Window of 2: (25 + 12.5) / 2 = 18.75 → one decimal.
        assert_eq!(r.poll_once(), Some(18.8));
    }

    #[test]
    fn failed_read_keeps_previous_value() {
        let r = reader(vec![Some(1.0), None, Some(1.0)], false, 4);
        let notified = Rc::new(Cell::new(0));
        let n = Rc::clone(&notified);
        r.channel().subscribe(move |_| n.set(n.get() + 1));

        assert_eq!(r.poll_once(), Some(50.0));
        assert_eq!(r.poll_once(), Some(50.0));
        assert_eq!(r.value(), Some(50.0));
        // Third read is identical after filtering: no extra notification.
        assert_eq!(r.poll_once(), Some(50.0));
        assert_eq!(notified.get(), 1);
    }

    #[test]
    fn failed_first_read_yields_nothing() {
        let r = reader(vec![None], true, 4);
        assert_eq!(r.poll_once(), None);
        assert_eq!(r.value(), None);
    }

    #[test]
    fn round_to_zero_decimals_gives_whole_numbers() {
        assert_eq!(round_to(41.6, 0), 42.0);
        assert_eq!(round_to(41.649, 2), 41.65);
    }

    #[test]
    fn discover_returns_first_hit() {
        let mut calls = 0;
        let found = discover(5, Duration::ZERO, || {
            calls += 1;
            (calls == 3).then_some("28-0000")
        })
        .unwrap();
        assert_eq!(found, "28-0000");
        assert_eq!(calls, 3);
    }

    #[test]
    fn discover_gives_up_after_bounded_attempts() {
        let mut calls = 0;
        let err = discover::<()>(4, Duration::ZERO, || {
            calls += 1;
            None
        })
        .unwrap_err();
        assert_eq!(calls, 4);
        assert!(matches!(err, Error::ProbeNotFound { attempts: 4 }));
    }
}
