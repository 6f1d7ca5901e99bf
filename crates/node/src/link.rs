//! Link-layer (Wi-Fi) control for the telemetry reporter.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use greenhouse_control::telemetry::NetworkLink;
use greenhouse_control::{Error, Result};

use crate::config::{LinkKind, NetworkConfig};

/// NetworkManager device state meaning "fully connected".
const NM_STATE_CONNECTED: u32 = 100;

pub enum Link {
    /// Wired or otherwise unmanaged interface. Association is only tracked.
    Static(Cell<bool>),
    Nmcli(NmcliLink),
}

impl Link {
    pub fn from_config(cfg: &NetworkConfig) -> Self {
        match cfg.kind {
            LinkKind::Static => Link::Static(Cell::new(true)),
            LinkKind::Nmcli => Link::Nmcli(NmcliLink::new(&cfg.interface, &cfg.connection)),
        }
    }

    /// Start tracking the real device state. Needs a `LocalSet`.
    pub fn spawn_monitor(&self, every: Duration) {
        if let Link::Nmcli(link) = self {
            tokio::task::spawn_local(link.clone().monitor(every));
        }
    }
}

impl NetworkLink for Link {
    async fn disassociate(&self) -> Result<()> {
        match self {
            Link::Static(up) => {
                up.set(false);
                Ok(())
            }
            Link::Nmcli(link) => link.disassociate().await,
        }
    }

    fn is_associated(&self) -> bool {
        match self {
            Link::Static(up) => up.get(),
            Link::Nmcli(link) => link.associated.get(),
        }
    }

    async fn associate(&self) -> Result<()> {
        match self {
            Link::Static(up) => {
                up.set(true);
                Ok(())
            }
            Link::Nmcli(link) => link.associate().await,
        }
    }
}

/// Wi-Fi driven through `nmcli`.
#[derive(Clone)]
pub struct NmcliLink {
    interface: String,
    connection: String,
    associated: Rc<Cell<bool>>,
}

impl NmcliLink {
    pub fn new(interface: &str, connection: &str) -> Self {
        Self {
            interface: interface.to_string(),
            connection: connection.to_string(),
            associated: Rc::new(Cell::new(false)),
        }
    }

    async fn disassociate(&self) -> Result<()> {
        nmcli(&["device", "disconnect", &self.interface]).await?;
        self.associated.set(false);
        info!(interface = %self.interface, "wifi disconnected");
        Ok(())
    }

    async fn associate(&self) -> Result<()> {
        let (conn, iface) = (self.connection.as_str(), self.interface.as_str());
        nmcli(&["connection", "up", conn, "ifname", iface]).await?;
        self.associated.set(true);
        info!(interface = %self.interface, connection = %self.connection, "wifi connected");
        Ok(())
    }

    async fn refresh(&self) -> Result<bool> {
        let iface = self.interface.as_str();
        let out = nmcli(&["-t", "-f", "GENERAL.STATE", "device", "show", iface]).await?;
        let up = parse_device_state(&out).is_some_and(|s| s == NM_STATE_CONNECTED);
        if self.associated.replace(up) != up {
            debug!(interface = %self.interface, up, "link state changed");
        }
        Ok(up)
    }

    async fn monitor(self, every: Duration) {
        loop {
            if let Err(e) = self.refresh().await {
                warn!(interface = %self.interface, "link state check failed: {e}");
                self.associated.set(false);
            }
            tokio::time::sleep(every).await;
        }
    }
}

async fn nmcli(args: &[&str]) -> Result<String> {
    let out = Command::new("nmcli")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Hardware(format!("failed to run nmcli: {e}")))?;
    if !out.status.success() {
        return Err(Error::Hardware(format!(
            "nmcli {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Numeric state out of `nmcli -t -f GENERAL.STATE device show` output,
/// e.g. `GENERAL.STATE:100 (connected)`.
fn parse_device_state(output: &str) -> Option<u32> {
    output
        .lines()
        .find_map(|l| l.strip_prefix("GENERAL.STATE:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|code| code.parse().ok())
}

// ===========================================================================
// Tests
// ===========================================================================
