//! DS18B20 temperature probe through the kernel 1-Wire sysfs interface.
//!
//! Reading `w1_slave` runs the conversion in the kernel and blocks for up to
//! 750 ms, so samples are taken on a dedicated thread and the async side
//! only sees the latest completed one.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use greenhouse_control::hw::SensorInput;
use greenhouse_control::sensor::discover;
use greenhouse_control::{Error, Result};

pub const DEVICES_DIR: &str = "/sys/bus/w1/devices";

/// DS18B20 family code prefix of the device directory name.
const FAMILY_PREFIX: &str = "28-";

pub struct Ds18b20 {
    slave: PathBuf,
}

impl Ds18b20 {
    /// Look for a probe under `devices`, retrying `attempts` times
    /// `delay` apart. Blocks the calling thread.
    pub fn discover(devices: &Path, attempts: u32, delay: Duration) -> Result<Self> {
        let dir = discover(attempts, delay, || find_probe(devices))?;
        tracing::info!(probe = %dir.display(), "ds18b20 found");
        Ok(Self {
            slave: dir.join("w1_slave"),
        })
    }

    fn sample(&self) -> Result<f64> {
        let contents = fs::read_to_string(&self.slave)
            .map_err(|e| Error::SensorRead(format!("{}: {e}", self.slave.display())))?;
        parse_w1_slave(&contents)
    }

    /// Move the probe onto its own thread, sampling every `every`.
    pub fn spawn_sampler(self, every: Duration) -> Result<SampledProbe> {
        let latest = Arc::new(Mutex::new(None));
        let shared = Arc::clone(&latest);
        thread::Builder::new()
            .name("ds18b20".into())
            .spawn(move || loop {
                let sample = self.sample().map_err(|e| e.to_string());
                if let Ok(mut slot) = shared.lock() {
                    *slot = Some(sample);
                }
                thread::sleep(every);
            })
            .map_err(|e| Error::Hardware(format!("failed to start ds18b20 sampler: {e}")))?;
        Ok(SampledProbe { latest })
    }
}

/// Latest outcome of a probe running on its sampler thread.
pub struct SampledProbe {
    latest: Arc<Mutex<Option<std::result::Result<f64, String>>>>,
}

fn find_probe(devices: &Path) -> Option<PathBuf> {
    let mut found: Vec<PathBuf> = fs::read_dir(devices)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(FAMILY_PREFIX))
        .map(|e| e.path())
        .collect();
    found.sort();
    found.into_iter().next()
}

/// `w1_slave` holds two lines: the raw scratchpad ending in `YES` when the
/// CRC matched, then the same bytes followed by `t=<millidegrees>`.
fn parse_w1_slave(contents: &str) -> Result<f64> {
    let mut lines = contents.lines();
    let crc_line = lines.next().unwrap_or_default();
    if !crc_line.trim_end().ends_with("YES") {
        return Err(Error::SensorRead("ds18b20 crc check failed".into()));
    }
    let millis: i64 = lines
        .next()
        .and_then(|l| l.rsplit_once("t="))
        .and_then(|(_, t)| t.trim().parse().ok())
        .ok_or_else(|| Error::SensorRead("ds18b20 reply has no temperature".into()))?;
    Ok(millis as f64 / 1000.0)
}

impl SensorInput for SampledProbe {
    fn read(&mut self) -> Result<f64> {
        let slot = self
            .latest
            .lock()
            .map_err(|_| Error::SensorRead("ds18b20 sampler panicked".into()))?;
        match slot.as_ref() {
            Some(Ok(celsius)) => Ok(*celsius),
            Some(Err(e)) => Err(Error::SensorRead(e.clone())),
            None => Err(Error::SensorRead("ds18b20 has no conversion yet".into())),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n\
                        72 01 4b 46 7f ff 0e 10 57 t=23125\n";

    #[test]
    fn parses_millidegrees() {
        assert_eq!(parse_w1_slave(GOOD).unwrap(), 23.125);
    }

    #[test]
    fn parses_below_zero() {
        let reply = "ff ff : crc=ab YES\nff ff t=-1250\n";
        assert_eq!(parse_w1_slave(reply).unwrap(), -1.25);
    }

    #[test]
    fn crc_failure_is_a_read_error() {
        let reply = GOOD.replace("YES", "NO");
        assert!(matches!(parse_w1_slave(&reply), Err(Error::SensorRead(_))));
    }

    #[test]
    fn missing_temperature_is_a_read_error() {
        assert!(parse_w1_slave("00 : crc=00 YES\n").is_err());
        assert!(parse_w1_slave("").is_err());
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("w1-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn discovers_and_reads_probe() {
        let devices = scratch_dir("found");
        fs::create_dir(devices.join("w1_bus_master1")).unwrap();
        let probe = devices.join("28-00000a1b2c3d");
        fs::create_dir(&probe).unwrap();
        fs::write(probe.join("w1_slave"), GOOD).unwrap();

        let sensor = Ds18b20::discover(&devices, 1, Duration::ZERO).unwrap();
        assert_eq!(sensor.sample().unwrap(), 23.125);
        fs::remove_dir_all(&devices).unwrap();
    }

    #[test]
    fn sampler_serves_latest_conversion() {
        let devices = scratch_dir("sampled");
        let probe = devices.join("28-0000000000aa");
        fs::create_dir(&probe).unwrap();
        fs::write(probe.join("w1_slave"), GOOD).unwrap();

        let mut sensor = Ds18b20::discover(&devices, 1, Duration::ZERO)
            .unwrap()
            .spawn_sampler(Duration::from_millis(5))
            .unwrap();
        let mut reading = sensor.read();
        for _ in 0..200 {
            if reading.is_ok() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
            reading = sensor.read();
        }
        assert_eq!(reading.unwrap(), 23.125);

        fs::write(probe.join("w1_slave"), GOOD.replace("YES", "NO")).unwrap();
        let mut failed = false;
        for _ in 0..200 {
            thread::sleep(Duration::from_millis(5));
            if matches!(sensor.read(), Err(Error::SensorRead(_))) {
                failed = true;
                break;
            }
        }
        assert!(failed, "crc failure should surface as a read error");
    }

    #[test]
    fn discovery_gives_up_without_probe() {
        let devices = scratch_dir("empty");
        let err = Ds18b20::discover(&devices, 3, Duration::ZERO).err().unwrap();
        assert!(matches!(err, Error::ProbeNotFound { attempts: 3 }));
        fs::remove_dir_all(&devices).unwrap();
    }
}
