//! Per-peripheral discovery readiness.
//!
//! A peripheral becomes sync-ready once every required service and every
//! required characteristic has been discovered. Discovery callbacks arrive
//! in no particular order, so the tracker only records facts and answers
//! [`ReadinessTracker::is_ready`] as a pure function of its maps.

use std::collections::BTreeMap;

use ddsync_types::{CharacteristicId, ServiceId};

/// Discovery status of one service or characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadinessStatus {
    /// Not yet discovered.
    #[default]
    NotReady,
    /// Discovered.
    Ready,
}

/// Readiness gate for one peripheral.
#[derive(Debug, Clone)]
pub struct ReadinessTracker {
    services: BTreeMap<ServiceId, ReadinessStatus>,
    characteristics: BTreeMap<CharacteristicId, ReadinessStatus>,
}

impl Default for ReadinessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessTracker {
    /// A tracker with every required entry `NotReady`.
    pub fn new() -> Self {
        Self {
            services: ServiceId::REQUIRED
                .into_iter()
                .map(|s| (s, ReadinessStatus::NotReady))
                .collect(),
            characteristics: CharacteristicId::REQUIRED
                .into_iter()
                .map(|c| (c, ReadinessStatus::NotReady))
                .collect(),
        }
    }

    /// Record the status of a service. Non-required services are ignored.
    pub fn set_service_status(&mut self, id: ServiceId, status: ReadinessStatus) {
        if let Some(entry) = self.services.get_mut(&id) {
            *entry = status;
        }
    }

    /// Record the status of a characteristic. Non-required characteristics are ignored.
    pub fn set_characteristic_status(&mut self, id: CharacteristicId, status: ReadinessStatus) {
        if let Some(entry) = self.characteristics.get_mut(&id) {
            *entry = status;
        }
    }

    /// Whether every required service and characteristic is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.services
            .values()
            .chain(self.characteristics.values())
            .all(|s| *s == ReadinessStatus::Ready)
    }

    /// Required services not yet discovered.
    pub fn missing_services(&self) -> Vec<ServiceId> {
        self.services
            .iter()
            .filter(|(_, status)| **status == ReadinessStatus::NotReady)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Required characteristics not yet discovered.
    pub fn missing_characteristics(&self) -> Vec<CharacteristicId> {
        self.characteristics
            .iter()
            .filter(|(_, status)| **status == ReadinessStatus::NotReady)
            .map(|(id, _)| *id)
            .collect()
    }
}
