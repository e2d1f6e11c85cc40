use std::sync::Arc;

use ethica_events::Bus;
use serde::Serialize;

/// Connector-scoped handle onto the shared event bus.
#[derive(Clone)]
pub struct EventSink {
    bus: Bus,
    connector: Arc<str>,
}

impl EventSink {
    pub fn new(bus: Bus, connector: &str) -> Self {
        Self {
            bus,
            connector: Arc::from(connector),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn emit<T: Serialize>(&self, kind: &str, payload: &T) {
        self.bus.publish(&self.connector, kind, payload);
    }
}
