//! Production/consumption rate declarations.
//!
//! Every actor endpoint carries a declared [`Rate`]: either a fixed item
//! count per firing or a bounded `[min, max]` range. Scheduling requires
//! *fixed* rates on every edge actually scheduled; range rates must be
//! resolved to a fixed choice first (or the affected actor is excluded from
//! further fusion).
//!
//! Inputs additionally declare a peek rate, the total number of items
//! examined per firing, of which only `pop` are consumed. Peeking beyond the
//! pop count restricts fusion and adds buffer overhang, but never
//! constrains firing multiplicities.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A per-firing item rate: fixed or a bounded range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rate {
    min: u64,
    max: u64,
}

/// Error constructing or resolving a [`Rate`].
#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum RateError {
    #[error("rate range [{min}, {max}] is empty")]
    #[diagnostic(code(streamfuse::rate::empty_range))]
    EmptyRange { min: u64, max: u64 },

    #[error("choice {choice} is outside rate range [{min}, {max}]")]
    #[diagnostic(code(streamfuse::rate::out_of_range))]
    OutOfRange { choice: u64, min: u64, max: u64 },
}

impl Rate {
    /// A fixed rate of exactly `n` items per firing.
    #[must_use]
    pub fn fixed(n: u64) -> Self {
        Self { min: n, max: n }
    }

    /// A bounded range rate.
    pub fn range(min: u64, max: u64) -> Result<Self, RateError> {
        if min > max {
            return Err(RateError::EmptyRange { min, max });
        }
        Ok(Self { min, max })
    }

    #[must_use]
    pub fn min(&self) -> u64 {
        self.min
    }

    #[must_use]
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Returns `true` if this rate is a single fixed value.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.min == self.max
    }

    /// The fixed value, if this rate is fixed.
    #[must_use]
    pub fn as_fixed(&self) -> Option<u64> {
        self.is_fixed().then_some(self.max)
    }

    /// Resolve a range rate to a fixed choice within its bounds.
    pub fn resolve(&self, choice: u64) -> Result<Rate, RateError> {
        if choice < self.min || choice > self.max {
            return Err(RateError::OutOfRange {
                choice,
                min: self.min,
                max: self.max,
            });
        }
        Ok(Rate::fixed(choice))
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_fixed() {
            write!(f, "{}", self.max)
        } else {
            write!(f, "[{}, {}]", self.min, self.max)
        }
    }
}

/// Rate declaration for one actor input: items consumed and items examined
/// per firing.
///
/// `peek` counts the *total* window examined, so `peek >= pop` whenever the
/// actor looks ahead; a non-peeking input has `peek == pop` (or less, which
/// is treated the same).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRate {
    pub pop: Rate,
    pub peek: Rate,
}

impl InputRate {
    /// A plain consuming input: pops `n`, examines exactly what it pops.
    #[must_use]
    pub fn popping(n: u64) -> Self {
        Self {
            pop: Rate::fixed(n),
            peek: Rate::fixed(n),
        }
    }

    /// A peeking input: pops `pop` but examines `peek` items per firing.
    #[must_use]
    pub fn peeking(pop: u64, peek: u64) -> Self {
        Self {
            pop: Rate::fixed(pop),
            peek: Rate::fixed(peek),
        }
    }

    /// Returns `true` if this input examines items beyond what it consumes.
    ///
    /// Only meaningful once rates are fixed; range rates are conservatively
    /// treated as peeking (their maximum window may exceed the pop count).
    #[must_use]
    pub fn is_peeking(&self) -> bool {
        self.peek.max() > self.pop.min()
    }

    /// Items examined but not consumed per firing, once fixed.
    #[must_use]
    pub fn peek_overhang(&self) -> u64 {
        self.peek.max().saturating_sub(self.pop.max())
    }

    /// Returns `true` if both pop and peek rates are fixed.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.pop.is_fixed() && self.peek.is_fixed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_and_range() {
        let f = Rate::fixed(3);
        assert!(f.is_fixed());
        assert_eq!(f.as_fixed(), Some(3));

        let r = Rate::range(1, 4).unwrap();
        assert!(!r.is_fixed());
        assert_eq!(r.as_fixed(), None);
        assert_eq!(r.resolve(2).unwrap(), Rate::fixed(2));
        assert_eq!(
            r.resolve(9),
            Err(RateError::OutOfRange {
                choice: 9,
                min: 1,
                max: 4
            })
        );
        assert!(Rate::range(5, 2).is_err());
    }

    #[test]
    fn peeking_detection() {
        assert!(!InputRate::popping(2).is_peeking());
        let p = InputRate::peeking(2, 5);
        assert!(p.is_peeking());
        assert_eq!(p.peek_overhang(), 3);
    }
}
