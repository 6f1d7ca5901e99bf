//! Periodic telemetry: snapshot the live state of every sensor, actuator
//! and controller and publish it as JSON. Also hosts the console status
//! logger, which reads the same sources.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::actuator::Actuator;
use crate::controller::Controller;
use crate::daynight::Clock;
use crate::observable::Latest;
use crate::sensor::SensorReader;
use crate::Result;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorReport {
    pub available: bool,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerReport {
    pub enabled: bool,
    pub busy: bool,
}

/// Wire payload. Maps are ordered so the JSON is stable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub timestamp: i64,
    pub sensors: BTreeMap<String, f64>,
    pub actuators: BTreeMap<String, ActuatorReport>,
    pub controllers: BTreeMap<String, ControllerReport>,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Live references to everything that gets reported.
#[derive(Clone, Default)]
pub struct Sources {
    pub sensors: Vec<Rc<SensorReader>>,
    pub actuators: Vec<Rc<dyn Actuator>>,
    pub controllers: Vec<Rc<dyn Controller>>,
}

impl Sources {
    /// Sensors without a first reading are left out.
    pub fn snapshot(&self, timestamp: i64) -> Snapshot {
        let sensors = self
            .sensors
            .iter()
            .filter_map(|s| Some((s.name().to_string(), s.value()?)))
            .collect();
        let actuators = self
            .actuators
            .iter()
            .map(|a| {
                let report = ActuatorReport {
                    available: a.available(),
                    info: a.info(),
                };
                (a.name().to_string(), report)
            })
            .collect();
        let controllers = self
            .controllers
            .iter()
            .map(|c| {
                let report = ControllerReport {
                    enabled: c.is_enabled(),
                    busy: c.is_busy(),
                };
                (c.name().to_string(), report)
            })
            .collect();
        Snapshot {
            timestamp,
            sensors,
            actuators,
            controllers,
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// MQTT-style delivery guarantee, configured as 0, 1 or 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "u8")]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> std::result::Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("qos must be 0, 1 or 2, got {other}")),
        }
    }
}

/// Application-layer publish connection (the MQTT broker).
#[allow(async_fn_in_trait)]
pub trait TelemetrySink {
    /// Start connecting. Completion is observed through `is_connected`.
    async fn connect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;
    async fn publish(&self, topic: &str, payload: String, qos: QoS) -> Result<()>;
}

/// Link-layer connection (the Wi-Fi association).
#[allow(async_fn_in_trait)]
pub trait NetworkLink {
    async fn disassociate(&self) -> Result<()>;
    fn is_associated(&self) -> bool;
    async fn associate(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ReporterSettings {
    pub topic: String,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Delay between connectivity rechecks.
    #[serde(default = "default_retry_secs")]
    pub retry_secs: u64,
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_retry_secs() -> u64 {
    5
}

/// How often readiness is polled while waiting on a connection.
const READY_POLL: Duration = Duration::from_millis(250);

pub struct Reporter<S, L> {
    sink: S,
    link: L,
    sources: Sources,
    clock: Rc<dyn Clock>,
    settings: ReporterSettings,
}

impl<S: TelemetrySink, L: NetworkLink> Reporter<S, L> {
    pub fn new(
        sink: S,
        link: L,
        sources: Sources,
        clock: Rc<dyn Clock>,
        settings: ReporterSettings,
    ) -> Self {
        Self {
            sink,
            link,
            sources,
            clock,
            settings,
        }
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.settings.retry_secs)
    }

    /// Drop the link entirely, associate from scratch, connect the sink and
    /// wait until both layers report ready. Retries forever.
    pub async fn startup(&self) {
        info!("resetting network link");
        while let Err(e) = self.link.disassociate().await {
            warn!("disassociate failed: {e}");
            sleep(self.retry_delay()).await;
        }
        while self.link.is_associated() {
            sleep(READY_POLL).await;
        }

        while let Err(e) = self.link.associate().await {
            warn!("associate failed: {e}");
            sleep(self.retry_delay()).await;
        }
        while let Err(e) = self.sink.connect().await {
            warn!("broker connect failed: {e}");
            sleep(self.retry_delay()).await;
        }
        while !(self.link.is_associated() && self.sink.is_connected()) {
            sleep(READY_POLL).await;
        }
        info!("telemetry online");
    }

    /// Publish one snapshot. Returns false if nothing was sent.
    pub async fn report_once(&self) -> bool {
        if !self.sink.is_connected() {
            return false;
        }
        let snapshot = self.sources.snapshot(self.clock.unix_timestamp());
        let payload = match snapshot.to_json() {
            Ok(p) => p,
            Err(e) => {
                warn!("snapshot encoding failed: {e}");
                return false;
            }
        };
        match self
            .sink
            .publish(&self.settings.topic, payload, self.settings.qos)
            .await
        {
            Ok(()) => {
                debug!(topic = %self.settings.topic, "snapshot published");
                true
            }
            Err(e) => {
                warn!("publish failed, retrying next tick: {e}");
                false
            }
        }
    }

    pub async fn run(self) {
        self.startup().await;
        let interval = Duration::from_millis(self.settings.interval_ms);
        loop {
            if !self.link.is_associated() {
                warn!("network link lost");
                self.startup().await;
            }
            if !self.sink.is_connected() {
                debug!("broker not connected, waiting");
                sleep(self.retry_delay()).await;
                continue;
            }
            self.report_once().await;
            sleep(interval).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Console status logger
// ---------------------------------------------------------------------------

/// Periodically logs the state of every actuator, controller and sensor.
pub struct StatusLogger {
    sensors: Vec<(Rc<SensorReader>, Rc<Latest<f64>>)>,
    actuators: Vec<Rc<dyn Actuator>>,
    controllers: Vec<Rc<dyn Controller>>,
}

impl StatusLogger {
    pub fn new(sources: &Sources) -> Self {
        Self {
            sensors: sources
                .sensors
                .iter()
                .map(|s| (Rc::clone(s), s.channel().watch()))
                .collect(),
            actuators: sources.actuators.clone(),
            controllers: sources.controllers.clone(),
        }
    }

    /// One line per item. Reading a sensor's line clears its changed flag.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for a in &self.actuators {
            let state = if a.available() { "free" } else { "busy" };
            lines.push(format!("actuator {}: {state} ({})", a.name(), a.info()));
        }
        for c in &self.controllers {
            lines.push(format!(
                "controller {}: enabled={} busy={}",
                c.name(),
                c.is_enabled(),
                c.is_busy()
            ));
        }
        for (reader, latest) in &self.sensors {
            let changed = if latest.changed() { "changed" } else { "unchanged" };
            latest.take();
            match reader.value() {
                Some(v) => lines.push(format!("sensor {}: {v} ({changed})", reader.name())),
                None => lines.push(format!("sensor {}: no reading yet", reader.name())),
            }
        }
        lines
    }

    pub async fn run(self, interval: Duration) {
        loop {
            for line in self.lines() {
                info!("{line}");
            }
            sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::tests::{RecordingPin, RecordingPwm};
    use crate::actuator::{OnOffActuator, PwmActuator};
    use crate::controller::{LightController, LightSettings};
    use crate::daynight::tests::ManualClock;
    use crate::hw::SensorInput;
    use crate::sensor::ReaderSettings;
    use crate::Error;
    use std::cell::{Cell, RefCell};

    struct Fixed(f64);

    impl SensorInput for Fixed {
        fn read(&mut self) -> Result<f64> {
            Ok(self.0)
        }
    }

    fn reader(name: &str, value: f64) -> Rc<SensorReader> {
        let settings = ReaderSettings {
            history_length: 1,
            decimals: 1,
            poll_ms: 500,
        };
        Rc::new(SensorReader::direct(name, Box::new(Fixed(value)), &settings))
    }

    fn sources() -> Sources {
        let light = reader("light", 40.0);
        let moisture = reader("moisture", 55.5);
        let temperature = reader("temperature", 21.0);
        light.poll_once();
        moisture.poll_once();

        let pump = Rc::new(OnOffActuator::new("pump", Box::new(RecordingPin::default())));
        let led = Rc::new(PwmActuator::new("grow_light", Box::new(RecordingPwm::default())));
        led.lock();
        let ctrl = LightController::new(&light, Rc::clone(&led), LightSettings { threshold: 50.0 });
        ctrl.enable();

        Sources {
            sensors: vec![light, moisture, temperature],
            actuators: vec![pump, led],
            controllers: vec![ctrl],
        }
    }

    #[test]
    fn snapshot_matches_wire_format() {
        let json = sources().snapshot(1_700_000_000).to_json().unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"timestamp":1700000000,"#,
                r#""sensors":{"light":40.0,"moisture":55.5},"#,
                r#""actuators":{"grow_light":{"available":false,"info":"0%"},"#,
                r#""pump":{"available":true,"info":"off"}},"#,
                r#""controllers":{"light":{"enabled":true,"busy":false}}}"#
            )
        );
    }

    #[test]
    fn qos_accepts_only_mqtt_levels() {
        assert_eq!(QoS::try_from(0), Ok(QoS::AtMostOnce));
        assert_eq!(QoS::try_from(2), Ok(QoS::ExactlyOnce));
        assert!(QoS::try_from(3).is_err());
    }

    // -- Reporter -----------------------------------------------------------

    #[derive(Default)]
    struct FakeSink {
        connected: Cell<bool>,
        connects: Cell<u32>,
        fail_publish: Cell<bool>,
        published: RefCell<Vec<(String, String, QoS)>>,
    }

    impl TelemetrySink for &FakeSink {
        async fn connect(&self) -> Result<()> {
            self.connects.set(self.connects.get() + 1);
            self.connected.set(true);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.get()
        }

        async fn publish(&self, topic: &str, payload: String, qos: QoS) -> Result<()> {
            if self.fail_publish.get() {
                return Err(Error::Sink("broker went away".into()));
            }
            self.published
                .borrow_mut()
                .push((topic.to_string(), payload, qos));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeLink {
        associated: Cell<bool>,
        calls: RefCell<Vec<&'static str>>,
        failures_left: Cell<u32>,
    }

    impl NetworkLink for &FakeLink {
        async fn disassociate(&self) -> Result<()> {
            self.calls.borrow_mut().push("disassociate");
            sleep(Duration::from_millis(300)).await;
            self.associated.set(false);
            Ok(())
        }

        fn is_associated(&self) -> bool {
            self.associated.get()
        }

        async fn associate(&self) -> Result<()> {
            self.calls.borrow_mut().push("associate");
            if self.failures_left.get() > 0 {
                self.failures_left.set(self.failures_left.get() - 1);
                return Err(Error::Hardware("no access point".into()));
            }
            self.associated.set(true);
            Ok(())
        }
    }

    fn settings() -> ReporterSettings {
        ReporterSettings {
            topic: "greenhouse/telemetry".into(),
            qos: QoS::AtLeastOnce,
            interval_ms: 1000,
            retry_secs: 5,
        }
    }

    fn reporter<'a>(
        sink: &'a FakeSink,
        link: &'a FakeLink,
    ) -> Reporter<&'a FakeSink, &'a FakeLink> {
        Reporter::new(
            sink,
            link,
            sources(),
            Rc::new(ManualClock::at(12, 0)),
            settings(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn startup_drops_stale_link_before_associating() {
        let sink = FakeSink::default();
        let link = FakeLink::default();
        link.associated.set(true);
        link.failures_left.set(2);

        reporter(&sink, &link).startup().await;

        assert_eq!(
            *link.calls.borrow(),
            vec!["disassociate", "associate", "associate", "associate"]
        );
        assert!(link.associated.get());
        assert!(sink.connected.get());
        assert_eq!(sink.connects.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_published_while_disconnected() {
        let sink = FakeSink::default();
        let link = FakeLink::default();
        let r = reporter(&sink, &link);

        assert!(!r.report_once().await);
        assert!(sink.published.borrow().is_empty());

        sink.connected.set(true);
        assert!(r.report_once().await);
        let published = sink.published.borrow();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "greenhouse/telemetry");
        assert_eq!(published[0].2, QoS::AtLeastOnce);
        assert!(published[0].1.starts_with(r#"{"timestamp":"#));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_is_retried_next_tick() {
        let sink = FakeSink::default();
        let link = FakeLink::default();
        let r = reporter(&sink, &link);
        r.startup().await;

        sink.fail_publish.set(true);
        let run = tokio::time::timeout(Duration::from_millis(3500), r.run());
        // A failing broker must not end the loop.
        assert!(run.await.is_err());
        assert!(sink.published.borrow().is_empty());

        sink.fail_publish.set(false);
        let r = reporter(&sink, &link);
        assert!(r.report_once().await);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_reruns_startup() {
        let sink = FakeSink::default();
        let link = FakeLink::default();
        let r = reporter(&sink, &link);

        let run = async {
            let _ = tokio::time::timeout(Duration::from_secs(10), r.run()).await;
        };
        let drop_link = async {
            sleep(Duration::from_secs(3)).await;
            link.associated.set(false);
        };
        tokio::join!(run, drop_link);

        let disassociations = link
            .calls
            .borrow()
            .iter()
            .filter(|c| **c == "disassociate")
            .count();
        assert_eq!(disassociations, 2);
        assert!(sink.published.borrow().len() >= 8);
    }

    // -- Status logger ------------------------------------------------------

    #[test]
    fn status_lines_flag_changed_sensors() {
        let src = sources();
        let logger = StatusLogger::new(&src);

        let first = logger.lines();
        assert!(first.contains(&"actuator pump: free (off)".to_string()));
        assert!(first.contains(&"actuator grow_light: busy (0%)".to_string()));
        assert!(first.contains(&"controller light: enabled=true busy=false".to_string()));
        assert!(first.contains(&"sensor temperature: no reading yet".to_string()));
        assert!(first.contains(&"sensor light: 40 (unchanged)".to_string()));

        src.sensors[2].poll_once();
        let second = logger.lines();
        assert!(second.contains(&"sensor temperature: 21 (changed)".to_string()));

        let third = logger.lines();
        assert!(third.contains(&"sensor temperature: 21 (unchanged)".to_string()));
    }
}
