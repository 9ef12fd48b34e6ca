//! Hierarchical timing wheel with intrusive, allocation-free timers.
//!
//! A [`Wheel`] tracks a large number of pending timers with O(1) amortized
//! scheduling, cancellation, and per-tick advancement. Timers scheduled far
//! in the future land on coarser levels and pay for the cheap bookkeeping
//! with timing precision: they fire no earlier than requested, and at most
//! one granularity unit of their level late.
//!
//! The wheel is driven externally: it never consults a clock. Call
//! [`Wheel::tick`] once per logical time unit from whatever loop owns the
//! wheel, or one of the `_with_limit` variants to bound expiry work per
//! call.
//!
//! Timers are caller-owned [`Timer`] values embedding their own bucket
//! linkage, so scheduling is a pointer splice and never allocates; the only
//! allocation the crate makes is the bucket slab at construction.
//!
//! # Example
//!
//! ```
//! use core::cell::Cell;
//! use core::num::{NonZeroU32, NonZeroUsize};
//! use core::pin::{pin, Pin};
//! use kronos::{ExpiryScope, TickSpan, Timer, Wheel, WheelConfig};
//!
//! fn expired(_scope: ExpiryScope<'_, Cell<u32>>, timer: Pin<&Timer<Cell<u32>>>) {
//!     timer.data().set(timer.data().get() + 1);
//! }
//!
//! let mut wheel = Wheel::new(WheelConfig {
//!     levels: NonZeroUsize::new(3).unwrap(),
//!     bucket_bits: NonZeroU32::new(5).unwrap(),
//!     granularity_bits: 3,
//! })
//! .unwrap();
//!
//! let timer = pin!(Timer::new(Cell::new(0), expired));
//! // SAFETY: the timer stays pinned on this frame until the wheel drops.
//! unsafe { wheel.schedule(TickSpan::new(40), timer.as_ref()) };
//!
//! // Lifetime 40 lands on level 1, which resolves in steps of 8 ticks.
//! assert_eq!(wheel.tick_many(40), 0);
//! assert_eq!(wheel.tick_many(8), 1);
//! assert_eq!(timer.data().get(), 1);
//! ```

#![warn(missing_docs)]

mod list;
mod tick;
mod timer;
pub(crate) mod trace;
mod wheel;

pub use tick::{TickInstant, TickSpan};
pub use timer::{ExpireFn, Timer};
pub use trace::init_tracing;
pub use wheel::{ExpiryScope, Wheel, WheelConfig, WheelError};
