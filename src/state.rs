use chrono::{DateTime, Utc};

use crate::messages::{Entry, Firmware, PointPointsetState, State};

/// Reportable device state plus the dirty flag that gates state publishes.
///
/// Every mutation marks the store dirty; the flag clears exactly when a
/// publish attempt begins, so a mutation queued behind an in-flight publish
/// is captured by the next one.
#[derive(Debug, Default)]
pub struct StateStore {
    state: State,
    dirty: bool,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_system(&mut self, serial_no: Option<String>, make_model: &str, firmware: &str) {
        self.state.system.operational = true;
        self.state.system.serial_no = serial_no;
        self.state.system.make_model = Some(make_model.to_string());
        self.state.system.firmware = Firmware {
            version: firmware.to_string(),
        };
        self.dirty = true;
    }

    pub fn upsert_point(&mut self, name: &str, fragment: PointPointsetState) {
        self.state.pointset.points.insert(name.to_string(), fragment);
        self.dirty = true;
    }

    /// `None` removes the status. Returns whether anything changed, so
    /// callers can skip publishing redundant clears.
    pub fn set_status(&mut self, key: &str, entry: Option<Entry>) -> bool {
        let changed = match entry {
            Some(entry) => {
                self.state.system.statuses.insert(key.to_string(), entry);
                true
            }
            None => self.state.system.statuses.remove(key).is_some(),
        };
        if changed {
            self.dirty = true;
        }
        changed
    }

    pub fn set_last_config(&mut self, timestamp: Option<DateTime<Utc>>) {
        self.state.system.last_config = timestamp;
        self.dirty = true;
    }

    pub fn set_state_etag(&mut self, etag: Option<String>) {
        self.state.pointset.state_etag = etag;
        self.dirty = true;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Snapshot for publishing; stamps the document with the publish time.
    pub fn stamped_snapshot(&mut self) -> State {
        self.state.timestamp = Utc::now();
        self.state.clone()
    }

    pub fn state(&self) -> &State {
        &self.state
    }
}
