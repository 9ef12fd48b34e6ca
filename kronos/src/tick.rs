//! Positions and distances on the wheel's time axis.
//!
//! Wheel time is a bare counter: the driver calls `tick` and the counter
//! moves one step. These two newtypes keep "a position on that counter"
//! and "a number of steps" from blurring into each other (or into other
//! `u64`s in the caller's code) while compiling down to nothing.
//!
//! Arithmetic that could overflow a `u64` is out of reach for any realistic
//! driver (centuries of runtime at one tick per nanosecond), so only debug
//! builds check it; the saturating helpers exist for callers that clamp
//! instead.

use core::ops::{Add, Sub};

/// A position on the wheel's tick counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TickInstant(u64);

impl TickInstant {
    /// Where every freshly built wheel starts.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Unwraps to the raw counter value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Distance from `earlier` up to `self`, clamped to zero when `earlier`
    /// is actually ahead.
    #[inline]
    #[must_use]
    pub fn span_since(self, earlier: Self) -> TickSpan {
        TickSpan(self.0.saturating_sub(earlier.0))
    }
}

/// A distance in ticks.
///
/// This is what `schedule` takes as a lifetime: "this many ticks from now".
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TickSpan(u64);

impl TickSpan {
    /// A distance of no ticks at all.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw tick count.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Unwraps to the raw tick count.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Adds two distances, clamping at the top of the `u64` range.
    #[inline]
    #[must_use]
    pub fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Add<TickSpan> for TickInstant {
    type Output = Self;

    #[inline]
    fn add(self, rhs: TickSpan) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for TickInstant {
    type Output = TickSpan;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.span_since(rhs)
    }
}

impl From<u64> for TickSpan {
    #[inline]
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}
