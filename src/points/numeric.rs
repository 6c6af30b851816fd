use super::SimRng;

/// Numeric flavor: bounded random walk inside a configured range.
#[derive(Debug, Clone)]
pub struct NumericPoint {
    min: f64,
    max: f64,
    value: f64,
}

impl NumericPoint {
    pub fn new(min: f64, max: f64) -> Self {
        debug_assert!(min <= max, "point range inverted: {min} > {max}");
        Self {
            min,
            max,
            value: (min + max) / 2.0,
        }
    }

    /// Step size scales with the range so narrow points drift slowly.
    pub fn advance(&mut self, rng: &mut SimRng) -> bool {
        let span = self.max - self.min;
        let step = (rng.next_f64() - 0.5) * span * 0.1;
        let next = (self.value + step).clamp(self.min, self.max);
        let changed = (next - self.value).abs() > f64::EPSILON;
        self.value = next;
        changed
    }

    /// Returns true when the range actually moved; the live value is
    /// clamped into the new range.
    pub fn set_range(&mut self, min: f64, max: f64) -> bool {
        debug_assert!(min <= max, "point range inverted: {min} > {max}");
        if (min - self.min).abs() < f64::EPSILON && (max - self.max).abs() < f64::EPSILON {
            return false;
        }
        self.min = min;
        self.max = max;
        self.value = self.value.clamp(min, max);
        true
    }

    pub fn baseline(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    pub fn tolerance(&self) -> f64 {
        (self.max - self.min) / 2.0
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}
