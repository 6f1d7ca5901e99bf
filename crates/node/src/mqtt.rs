//! MQTT telemetry sink on top of `rumqttc`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
};
use tokio::time::sleep;
use tracing::{info, warn};

use greenhouse_control::telemetry::{QoS, TelemetrySink};
use greenhouse_control::{Error, Result};

use crate::config::MqttConfig;

/// Payload of the last will, published by the broker if we vanish.
const LAST_WILL: &str = "Disconnecting...";

/// Delay before polling the event loop again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub fn qos_from_level(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// How an event loop event changes broker connectivity, if at all.
fn connectivity(event: &Event) -> Option<bool> {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => Some(ack.code == ConnectReturnCode::Success),
        Event::Incoming(Packet::Disconnect) | Event::Outgoing(Outgoing::Disconnect) => Some(false),
        _ => None,
    }
}

pub struct MqttSink {
    client: AsyncClient,
    eventloop: RefCell<Option<EventLoop>>,
    connected: Rc<Cell<bool>>,
}

impl MqttSink {
    pub fn new(cfg: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
        options.set_last_will(LastWill::new(
            &cfg.topic,
            LAST_WILL,
            qos_from_level(cfg.qos),
            false,
        ));
        let (client, eventloop) = AsyncClient::new(options, 10);
        info!(host = %cfg.host, port = cfg.port, topic = %cfg.topic, "mqtt sink configured");

        Self {
            client,
            eventloop: RefCell::new(Some(eventloop)),
            connected: Rc::new(Cell::new(false)),
        }
    }
}

/// Poll the event loop forever, tracking connectivity. The loop reconnects
/// by itself on the next poll after an error.
async fn drive(mut eventloop: EventLoop, connected: Rc<Cell<bool>>) {
    loop {
        match eventloop.poll().await {
            Ok(event) => match connectivity(&event) {
                Some(true) => {
                    info!("mqtt connected");
                    connected.set(true);
                }
                Some(false) => {
                    warn!("mqtt disconnected");
                    connected.set(false);
                }
                None => {}
            },
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                connected.set(false);
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

impl TelemetrySink for MqttSink {
    /// Starts the event loop task on first call. Later calls are no-ops
    /// since the loop reconnects on its own.
    async fn connect(&self) -> Result<()> {
        if let Some(eventloop) = self.eventloop.borrow_mut().take() {
            tokio::task::spawn_local(drive(eventloop, Rc::clone(&self.connected)));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    async fn publish(&self, topic: &str, payload: String, qos: QoS) -> Result<()> {
        self.client
            .publish(topic, qos_from_level(qos), false, payload)
            .await
            .map_err(|e| Error::Sink(e.to_string()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::ConnAck;

    #[test]
    fn qos_levels_map_one_to_one() {
        assert_eq!(qos_from_level(QoS::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(qos_from_level(QoS::AtLeastOnce), rumqttc::QoS::AtLeastOnce);
        assert_eq!(qos_from_level(QoS::ExactlyOnce), rumqttc::QoS::ExactlyOnce);
    }

    #[test]
    fn successful_connack_marks_connected() {
        let ack = ConnAck::new(ConnectReturnCode::Success, false);
        let event = Event::Incoming(Packet::ConnAck(ack));
        assert_eq!(connectivity(&event), Some(true));
    }

    #[test]
    fn refused_connack_is_not_connected() {
        let ack = ConnAck::new(ConnectReturnCode::NotAuthorized, false);
        let event = Event::Incoming(Packet::ConnAck(ack));
        assert_eq!(connectivity(&event), Some(false));
    }

    #[test]
    fn disconnect_either_way_marks_disconnected() {
        let received = Event::Incoming(Packet::Disconnect);
        let sent = Event::Outgoing(Outgoing::Disconnect);
        assert_eq!(connectivity(&received), Some(false));
        assert_eq!(connectivity(&sent), Some(false));
    }

    #[test]
    fn other_traffic_leaves_state_alone() {
        assert_eq!(connectivity(&Event::Incoming(Packet::PingResp)), None);
        assert_eq!(connectivity(&Event::Outgoing(Outgoing::PingReq)), None);
    }

    #[test]
    fn sink_starts_disconnected() {
        let sink = MqttSink::new(&MqttConfig::default());
        assert!(!sink.is_connected());
    }
}
