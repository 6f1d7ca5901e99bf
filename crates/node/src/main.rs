mod config;
mod hardware;
mod link;
mod mqtt;

#[cfg(feature = "gpio")]
mod adc;
#[cfg(feature = "gpio")]
mod gpio;
#[cfg(all(feature = "sim", not(feature = "gpio")))]
mod sim;
#[cfg(any(feature = "gpio", test))]
mod w1;

use anyhow::{Context, Result};
use std::{env, rc::Rc, time::Duration};
use tokio::task::{spawn_local, LocalSet};
use tracing_subscriber::EnvFilter;

use greenhouse_control::actuator::{Actuator, OnOffActuator, PwmActuator};
use greenhouse_control::controller::{
    Controller, HeatingDisabled, LightController, MoistureController, TemperatureController,
};
use greenhouse_control::daynight::{Clock, SystemClock};
use greenhouse_control::logic::Logic;
use greenhouse_control::roof::{EndStop, RoofOpener};
use greenhouse_control::sensor::{Calibration, SensorReader};
use greenhouse_control::telemetry::{Reporter, Sources, StatusLogger};

use config::Config;
use link::Link;
use mqtt::MqttSink;

/// How often the nmcli link state is refreshed.
const LINK_CHECK_EVERY: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    if let Ok(host) = env::var("MQTT_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.mqtt.port = port;
    }

    let clock: Rc<dyn Clock> = Rc::new(
        SystemClock::new(cfg.logic.utc_offset_hours).context("invalid utc_offset_hours")?,
    );

    LocalSet::new().run_until(run(cfg, clock)).await
}

async fn run(cfg: Config, clock: Rc<dyn Clock>) -> Result<()> {
    let hw = hardware::open(&cfg, Rc::clone(&clock)).await?;

    // ── Sensors ─────────────────────────────────────────────────────
    let light_sensor = Rc::new(SensorReader::analog(
        "light",
        hw.light,
        Calibration {
            max_voltage: cfg.sensors.light.max_voltage,
            invert: false,
        },
        &cfg.sensors.light.reader(),
    ));
    let moisture_sensor = Rc::new(SensorReader::analog(
        "moisture",
        hw.moisture,
        Calibration {
            max_voltage: cfg.sensors.moisture.max_voltage,
            invert: true,
        },
        &cfg.sensors.moisture.reader(),
    ));
    let temperature_sensor = Rc::new(SensorReader::direct(
        "temperature",
        hw.temperature,
        &cfg.sensors.temperature.reader(),
    ));

    // ── Actuators ───────────────────────────────────────────────────
    let pump = Rc::new(OnOffActuator::new("pump", hw.pump));
    let grow_light = Rc::new(PwmActuator::new("grow_light", hw.grow_light));
    let heater = hw.heater.map(|pin| Rc::new(PwmActuator::new("heater", pin)));
    let vent = match (hw.vent, &cfg.actuators.vent) {
        (Some(v), Some(vc)) => Some(Rc::new(
            RoofOpener::new(
                "vent",
                v.driver,
                EndStop::new("vent_open", v.open_switch),
                EndStop::new("vent_closed", v.close_switch),
                vc.motion.clone(),
            )
            .context("failed to arm vent limit switches")?,
        )),
        _ => None,
    };

    // ── Controllers ─────────────────────────────────────────────────
    let moisture = MoistureController::new(
        Rc::clone(&moisture_sensor),
        pump.clone(),
        cfg.controllers.moisture.clone(),
    );
    let light = LightController::new(
        &light_sensor,
        Rc::clone(&grow_light),
        cfg.controllers.light.clone(),
    );
    let mut controllers: Vec<Rc<dyn Controller>> =
        vec![moisture as Rc<dyn Controller>, light as Rc<dyn Controller>];
    if let (Some(settings), Some(vent)) = (&cfg.controllers.temperature, &vent) {
        controllers.push(TemperatureController::new(
            Rc::clone(&temperature_sensor),
            Rc::clone(vent),
            heater.clone(),
            Box::new(HeatingDisabled),
            settings.clone(),
        ));
    }

    let mut actuators: Vec<Rc<dyn Actuator>> =
        vec![pump as Rc<dyn Actuator>, grow_light as Rc<dyn Actuator>];
    if let Some(h) = &heater {
        actuators.push(h.clone());
    }
    if let Some(v) = &vent {
        actuators.push(v.clone());
    }

    let sensors = vec![
        Rc::clone(&light_sensor),
        Rc::clone(&moisture_sensor),
        Rc::clone(&temperature_sensor),
    ];
    let sources = Sources {
        sensors: sensors.clone(),
        actuators: actuators.clone(),
        controllers: controllers.clone(),
    };

    tracing::info!(
        controllers = controllers.len(),
        actuators = actuators.len(),
        vent = vent.is_some(),
        "greenhouse assembled"
    );

    // ── Tasks ───────────────────────────────────────────────────────
    for sensor in sensors {
        spawn_local(sensor.run());
    }

    let logic = Rc::new(Logic::new(
        cfg.schedule.clone(),
        Rc::clone(&clock),
        controllers,
        hw.heartbeat,
    ));
    spawn_local(logic.run(Duration::from_millis(cfg.logic.interval_ms)));

    if cfg.logger.enabled {
        let logger = StatusLogger::new(&sources);
        spawn_local(logger.run(Duration::from_secs(cfg.logger.interval_secs)));
    }

    let link = Link::from_config(&cfg.network);
    link.spawn_monitor(LINK_CHECK_EVERY);
    let reporter = Reporter::new(
        MqttSink::new(&cfg.mqtt),
        link,
        sources,
        clock,
        cfg.mqtt.reporter(),
    );

    tokio::select! {
        _ = reporter.run() => {}
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            tracing::info!("shutting down");
        }
    }

    // Leave every output in its safe state.
    for actuator in &actuators {
        actuator.power_off();
    }
    Ok(())
}
