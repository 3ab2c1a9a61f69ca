use std::fmt;

/// An outstanding request count that may be unbounded.
///
/// Used both for the consumer's demand and for the credit granted to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Demand {
    Bounded(u64),
    Unbounded,
}

impl Demand {
    pub const NONE: Demand = Demand::Bounded(0);

    pub fn is_zero(&self) -> bool {
        matches!(self, Demand::Bounded(0))
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Demand::Unbounded)
    }

    /// Saturating addition; unbounded absorbs everything.
    #[must_use]
    pub fn add(self, other: Demand) -> Demand {
        match (self, other) {
            (Demand::Bounded(a), Demand::Bounded(b)) => Demand::Bounded(a.saturating_add(b)),
            _ => Demand::Unbounded,
        }
    }

    /// Take one unit, returning `false` if there was none.
    pub fn take_one(&mut self) -> bool {
        match self {
            Demand::Bounded(0) => false,
            Demand::Bounded(n) => {
                *n -= 1;
                true
            }
            Demand::Unbounded => true,
        }
    }
}

impl Default for Demand {
    fn default() -> Self {
        Demand::NONE
    }
}

impl From<u64> for Demand {
    fn from(n: u64) -> Self {
        Demand::Bounded(n)
    }
}

impl From<u32> for Demand {
    fn from(n: u32) -> Self {
        Demand::Bounded(u64::from(n))
    }
}

impl fmt::Display for Demand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Demand::Bounded(n) => n.fmt(f),
            Demand::Unbounded => f.write_str("unbounded"),
        }
    }
}
