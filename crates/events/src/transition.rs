/// Result of applying a state transition to a stored record.
///
/// `Unchanged` carries the current record when the transition did not apply
/// (an idempotent no-op), so callers always see the latest state.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<T> {
    Changed(T),
    Unchanged(T),
}

impl<T> Transition<T> {
    pub fn changed(&self) -> bool {
        matches!(self, Transition::Changed(_))
    }

    pub fn get(&self) -> &T {
        match self {
            Transition::Changed(value) | Transition::Unchanged(value) => value,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Transition::Changed(value) | Transition::Unchanged(value) => value,
        }
    }
}
