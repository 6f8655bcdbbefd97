//! Deadlines expressed as in spec.md §6: `Infinite`, `Immediate`, or a finite instant.

use std::time::Instant;

/// A deadline attached to a pending read, write, or offer.
///
/// `Immediate` means "fail if this cannot complete right now" — equivalent to
/// a finite deadline already in the past. `Infinite` never fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Infinite,
    Immediate,
    At(Instant),
}

impl Deadline {
    /// A finite deadline `dur` from now.
    pub fn after(dur: std::time::Duration) -> Self {
        Deadline::At(Instant::now() + dur)
    }

    /// True if the deadline has already elapsed (or is `Immediate`).
    pub fn has_elapsed(&self) -> bool {
        match self {
            Deadline::Infinite => false,
            Deadline::Immediate => true,
            Deadline::At(at) => *at <= Instant::now(),
        }
    }

    /// True if this deadline ever fires.
    pub fn is_finite(&self) -> bool {
        !matches!(self, Deadline::Infinite)
    }

    /// The concrete instant this deadline fires at, if any. `Immediate` is
    /// treated as "now".
    pub fn instant(&self) -> Option<Instant> {
        match self {
            Deadline::Infinite => None,
            Deadline::Immediate => Some(Instant::now()),
            Deadline::At(at) => Some(*at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn immediate_has_always_elapsed() {
        assert!(Deadline::Immediate.has_elapsed());
    }

    #[test]
    fn infinite_never_elapses() {
        assert!(!Deadline::Infinite.has_elapsed());
        assert!(!Deadline::Infinite.is_finite());
    }

    #[test]
    fn future_deadline_has_not_elapsed_yet() {
        let d = Deadline::after(Duration::from_secs(60));
        assert!(!d.has_elapsed());
        assert!(d.is_finite());
    }

    #[test]
    fn past_deadline_has_elapsed() {
        let d = Deadline::At(Instant::now() - Duration::from_millis(1));
        assert!(d.has_elapsed());
    }
}
