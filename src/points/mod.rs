mod boolean;
mod numeric;

pub use boolean::BooleanPoint;
pub use numeric::NumericPoint;

use serde_json::Value;
use std::collections::HashMap;

use crate::agent::PubberError;
use crate::messages::{
    PointPointsetConfig, PointPointsetEvent, PointPointsetMetadata, PointPointsetState,
};

/// Units that select the boolean flavor at construction time.
const BOOLEAN_UNITS: &[&str] = &["foo"];
const DEFAULT_BASELINE_VALUE: f64 = 50.0;
const SEED_BASE: u64 = 0x1234_5678_9ABC_DEF0; // Fixed seed base for deterministic behavior

#[derive(Debug, Clone)]
pub struct SimRng {
    rng_state: u64,
}

impl SimRng {
    pub fn new(seed: u64) -> Self {
        Self { rng_state: seed }
    }

    /// Seeded from the point name so each point walks its own
    /// deterministic sequence.
    pub fn for_point(name: &str) -> Self {
        let seed = name
            .bytes()
            .fold(SEED_BASE, |hash, byte| {
                hash.wrapping_mul(31).wrapping_add(u64::from(byte))
            });
        Self::new(seed)
    }

    fn next_random(&mut self) -> u64 {
        // Linear congruential generator (Numerical Recipes constants)
        self.rng_state = self
            .rng_state
            .wrapping_mul(1_664_525)
            .wrapping_add(1_013_904_223);
        self.rng_state
    }

    pub fn next_f64(&mut self) -> f64 {
        (self.next_random() as f64) / (u64::MAX as f64)
    }

    pub fn next_bool(&mut self) -> bool {
        (self.next_random() >> 32) & 1 == 1
    }
}

#[derive(Debug, Clone)]
pub enum PointKind {
    Numeric(NumericPoint),
    Boolean(BooleanPoint),
}

/// One simulated data point: a live value plus the event and state
/// fragments folded into outbound documents.
#[derive(Debug, Clone)]
pub struct Point {
    name: String,
    writeable: bool,
    units: Option<String>,
    kind: PointKind,
    dirty: bool,
    rng: SimRng,
}

impl Point {
    pub fn from_metadata(name: &str, metadata: &PointPointsetMetadata) -> Result<Self, PubberError> {
        let units = metadata.units.clone();
        let boolean = units
            .as_deref()
            .is_some_and(|units| BOOLEAN_UNITS.contains(&units));
        let kind = if boolean {
            PointKind::Boolean(BooleanPoint::new())
        } else {
            let baseline =
                convert_value(name, metadata.baseline_value.as_ref(), DEFAULT_BASELINE_VALUE)?;
            // Tolerance falls back to the baseline itself, giving [0, 2b].
            let tolerance =
                convert_value(name, metadata.baseline_tolerance.as_ref(), baseline)?.abs();
            PointKind::Numeric(NumericPoint::new(baseline - tolerance, baseline + tolerance))
        };
        let mut point = Self {
            name: name.to_string(),
            writeable: metadata.writeable.unwrap_or(false),
            units,
            kind,
            dirty: true,
            rng: SimRng::for_point(name),
        };
        point.tick();
        point.dirty = true;
        Ok(point)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable
    }

    pub fn tick(&mut self) {
        let changed = match &mut self.kind {
            PointKind::Numeric(point) => point.advance(&mut self.rng),
            PointKind::Boolean(point) => point.advance(&mut self.rng),
        };
        if changed {
            self.dirty = true;
        }
    }

    /// Absent config means no change; previously applied overrides stick.
    pub fn apply_config(&mut self, config: Option<&PointPointsetConfig>) -> Result<(), PubberError> {
        let Some(config) = config else {
            return Ok(());
        };
        let mut changed = false;
        if let Some(writeable) = config.writeable {
            if writeable != self.writeable {
                self.writeable = writeable;
                changed = true;
            }
        }
        if let Some(units) = &config.units {
            if self.units.as_deref() != Some(units.as_str()) {
                self.units = Some(units.clone());
                changed = true;
            }
        }
        if let PointKind::Numeric(point) = &mut self.kind {
            if config.baseline_value.is_some() || config.baseline_tolerance.is_some() {
                let baseline =
                    convert_value(&self.name, config.baseline_value.as_ref(), point.baseline())?;
                let tolerance = convert_value(
                    &self.name,
                    config.baseline_tolerance.as_ref(),
                    point.tolerance(),
                )?
                .abs();
                if point.set_range(baseline - tolerance, baseline + tolerance) {
                    changed = true;
                }
            }
        }
        if changed {
            self.dirty = true;
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn event_fragment(&self) -> PointPointsetEvent {
        let present_value = match &self.kind {
            PointKind::Numeric(point) => Value::from(point.value()),
            PointKind::Boolean(point) => Value::Bool(point.value()),
        };
        PointPointsetEvent { present_value }
    }

    pub fn state_fragment(&self) -> PointPointsetState {
        PointPointsetState {
            writeable: Some(self.writeable),
            units: self.units.clone(),
        }
    }
}

fn convert_value(name: &str, value: Option<&Value>, default: f64) -> Result<f64, PubberError> {
    match value {
        None => Ok(default),
        Some(value) => value.as_f64().ok_or_else(|| {
            PubberError::Configuration(format!(
                "unknown baseline value type for point {name}: {value}"
            ))
        }),
    }
}

/// Points simulated when device metadata does not declare any.
pub(crate) fn default_points() -> HashMap<String, PointPointsetMetadata> {
    let mut points = HashMap::new();
    points.insert(
        "recalcitrant_angle".to_string(),
        point_model(Some(true), Some(50), Some(50), Some("Celsius")),
    );
    points.insert(
        "faulty_finding".to_string(),
        point_model(Some(true), Some(40), Some(0), Some("deg")),
    );
    points.insert(
        "superimposition_reading".to_string(),
        point_model(None, None, None, None),
    );
    points
}

fn point_model(
    writeable: Option<bool>,
    baseline: Option<i64>,
    tolerance: Option<i64>,
    units: Option<&str>,
) -> PointPointsetMetadata {
    PointPointsetMetadata {
        writeable,
        baseline_value: baseline.map(Value::from),
        baseline_tolerance: tolerance.map(Value::from),
        units: units.map(str::to_string),
    }
}
