//! The orchestrator: once per tick, force every controller into the state
//! the day/night policy asks for and blink the heartbeat output.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info};

use crate::controller::Controller;
use crate::daynight::{Clock, Phase, Schedule};
use crate::hw::DigitalOutput;

pub struct Logic {
    schedule: Schedule,
    clock: Rc<dyn Clock>,
    controllers: Vec<Rc<dyn Controller>>,
    heartbeat: RefCell<Option<Box<dyn DigitalOutput>>>,
    beat: Cell<bool>,
    phase: Cell<Option<Phase>>,
}

impl Logic {
    pub fn new(
        schedule: Schedule,
        clock: Rc<dyn Clock>,
        controllers: Vec<Rc<dyn Controller>>,
        heartbeat: Option<Box<dyn DigitalOutput>>,
    ) -> Self {
        Self {
            schedule,
            clock,
            controllers,
            heartbeat: RefCell::new(heartbeat),
            beat: Cell::new(false),
            phase: Cell::new(None),
        }
    }

    /// Phase seen on the last tick.
    pub fn phase(&self) -> Option<Phase> {
        self.phase.get()
    }

    /// `set_state` runs for every controller on every tick, whether or not
    /// the forced state differs from the current one.
    pub fn tick(&self) -> Option<Phase> {
        let beat = !self.beat.get();
        self.beat.set(beat);
        if let Some(led) = self.heartbeat.borrow_mut().as_mut() {
            led.set_level(beat);
        }

        let phase = self.schedule.current_phase(self.clock.as_ref());
        if self.phase.replace(phase) != phase {
            match phase {
                Some(p) => info!(phase = %p, "entering phase"),
                None => info!("outside every scheduled phase"),
            }
        }

        for ctrl in &self.controllers {
            let enabled = phase
                .and_then(|p| self.schedule.enabling(p, ctrl.kind()))
                .unwrap_or(true);
            ctrl.set_state(enabled);
        }
        debug!(beat, "logic tick");
        phase
    }

    pub async fn run(self: Rc<Self>, interval: Duration) {
        info!(schedule = %self.schedule.describe(), "logic started");
        loop {
            self.tick();
            tokio::time::sleep(interval).await;
        }
    }
}
