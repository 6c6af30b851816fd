use super::SimRng;

/// Boolean flavor: random toggle on every tick.
#[derive(Debug, Clone, Default)]
pub struct BooleanPoint {
    value: bool,
}

impl BooleanPoint {
    pub fn new() -> Self {
        Self { value: false }
    }

    pub fn advance(&mut self, rng: &mut SimRng) -> bool {
        let next = rng.next_bool();
        let changed = next != self.value;
        self.value = next;
        changed
    }

    pub fn value(&self) -> bool {
        self.value
    }
}
