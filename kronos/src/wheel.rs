//! Hierarchical timing wheel with O(1) schedule/cancel and bounded per-tick
//! work.
//!
//! Buckets are laid out as one flat slab of `levels * buckets_per_level`
//! intrusive lists. Each step on level `lvl` represents
//! `1 << (lvl * granularity_bits)` base ticks, so higher levels trade
//! precision for reach: a timer fires no earlier than requested and at most
//! one granularity unit of its level late.
//!
//! Expiry runs by draining the due bucket into a stack-local list before any
//! callback is invoked. Callbacks may therefore reschedule themselves (into
//! the very bucket being processed) without ever causing unbounded work
//! inside a single tick.

use core::marker::PhantomData;
use core::num::{NonZeroU32, NonZeroUsize};
use core::pin::Pin;
use core::ptr::NonNull;

use thiserror::Error;

use crate::list::List;
use crate::tick::{TickInstant, TickSpan};
use crate::timer::Timer;
use crate::trace::{debug, trace};

/// Wheel geometry (immutable after creation).
///
/// Each of the `levels` rings holds `1 << bucket_bits` buckets, and each
/// step on level `lvl` spans `1 << (lvl * granularity_bits)` base ticks.
/// `granularity_bits` must not exceed `bucket_bits`, otherwise a level could
/// not cover its sublevel's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelConfig {
    /// Number of levels in the hierarchy.
    pub levels: NonZeroUsize,
    /// log2 of the bucket count per level.
    pub bucket_bits: NonZeroU32,
    /// log2 of the granularity step between adjacent levels.
    pub granularity_bits: u32,
}

impl WheelConfig {
    /// Buckets per level.
    #[inline]
    #[must_use]
    pub const fn bucket_count(&self) -> usize {
        1 << self.bucket_bits.get()
    }

    /// The largest schedulable lifetime; longer lifetimes are clamped.
    #[must_use]
    pub fn max_lifetime(&self) -> TickSpan {
        let top_shift = (self.levels.get() as u32 - 1) * self.granularity_bits;
        let buckets = self.bucket_count() as u64;
        TickSpan::new(((buckets - 1) << top_shift) - (1 << top_shift))
    }

    /// Checks the geometry invariants.
    pub fn validate(&self) -> Result<(), WheelError> {
        let bucket_bits = self.bucket_bits.get();
        if self.granularity_bits > bucket_bits {
            return Err(WheelError::GranularityTooCoarse {
                granularity_bits: self.granularity_bits,
                bucket_bits,
            });
        }
        let top_shift = (self.levels.get() as u64 - 1) * u64::from(self.granularity_bits);
        let required_bits = top_shift + u64::from(bucket_bits);
        if required_bits > 63 {
            return Err(WheelError::GeometryOverflow { required_bits });
        }
        Ok(())
    }
}

/// Errors surfaced by wheel construction.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WheelError {
    /// The per-level granularity step is wider than a level's index space,
    /// so a level could not cover its sublevel's range.
    #[error(
        "granularity step of {granularity_bits} bits exceeds bucket index width of {bucket_bits} bits"
    )]
    GranularityTooCoarse {
        /// Configured `granularity_bits`.
        granularity_bits: u32,
        /// Configured `bucket_bits`.
        bucket_bits: u32,
    },
    /// The top level's reach does not fit the 64-bit tick space.
    #[error("wheel geometry needs {required_bits} bits of tick space, which exceeds 63")]
    GeometryOverflow {
        /// Bits of tick space the geometry would need.
        required_bits: u64,
    },
}

/// Hierarchical timing wheel.
///
/// The wheel never owns timers: scheduling links a caller-owned, pinned
/// [`Timer`] into a bucket, and cancellation is performed by the timer
/// itself. Exactly one allocation is made, at construction, for the bucket
/// slab; `schedule`, `tick`, and cancellation never allocate.
///
/// The wheel does not consult any clock. The caller drives it by invoking
/// [`tick`](Wheel::tick) once per logical time unit.
pub struct Wheel<T> {
    /// Bucket `(lvl, slot)` lives at index `lvl * bucket_count + slot`. The
    /// slab is heap-allocated, so node pointers into buckets survive moves
    /// of the `Wheel` value itself.
    buckets: Box<[List]>,
    ticks: u64,
    levels: usize,
    bucket_bits: u32,
    granularity_bits: u32,
    max_lifetime: u64,
    max_fired_per_tick: usize,
    // Invariant over T: timers of exactly this T are linked into the
    // buckets and recovered by cast when they fire.
    _timers: PhantomData<fn(T) -> T>,
}

impl<T> Wheel<T> {
    /// Creates a wheel with all buckets empty and the tick counter at zero.
    pub fn new(config: WheelConfig) -> Result<Self, WheelError> {
        config.validate()?;
        let bucket_count = config.bucket_count();
        let total = config.levels.get() * bucket_count;
        let buckets: Box<[List]> = (0..total).map(|_| List::new()).collect();
        Ok(Self {
            buckets,
            ticks: 0,
            levels: config.levels.get(),
            bucket_bits: config.bucket_bits.get(),
            granularity_bits: config.granularity_bits,
            max_lifetime: config.max_lifetime().get(),
            max_fired_per_tick: 0,
            _timers: PhantomData,
        })
    }

    /// The current position on the tick lattice.
    #[inline]
    #[must_use]
    pub fn now(&self) -> TickInstant {
        TickInstant::new(self.ticks)
    }

    /// The largest schedulable lifetime; longer lifetimes are clamped.
    #[inline]
    #[must_use]
    pub fn max_lifetime(&self) -> TickSpan {
        TickSpan::new(self.max_lifetime)
    }

    /// Number of levels.
    #[inline]
    #[must_use]
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Buckets per level.
    #[inline]
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        1 << self.bucket_bits
    }

    /// High-water mark of expirations observed in a single tick.
    #[inline]
    #[must_use]
    pub fn max_fired_per_tick(&self) -> usize {
        self.max_fired_per_tick
    }

    #[inline]
    fn bucket_mask(&self) -> u64 {
        (1 << self.bucket_bits) - 1
    }

    #[inline]
    fn granularity_mask(&self) -> u64 {
        (1 << self.granularity_bits) - 1
    }

    #[inline]
    fn bucket_index(&self, level: usize, slot: usize) -> usize {
        level * self.bucket_count() + slot
    }

    /// Reach of `level` in base ticks: the largest delta it can represent.
    #[inline]
    fn level_reach(&self, level: usize) -> u64 {
        self.bucket_mask() << (level as u32 * self.granularity_bits)
    }

    /// Maps a relative lifetime to its `(level, slot)` pair.
    fn placement(&self, lifetime: u64) -> (usize, usize) {
        // Oversize lifetimes clamp to the furthest representable slot on the
        // top level rather than erroring; long-lived callers reschedule.
        let delta = lifetime.saturating_sub(1).min(self.max_lifetime);
        let mut level = 0;
        while delta >= self.level_reach(level) {
            level += 1;
        }
        let shift = level as u32 * self.granularity_bits;
        // The +1 keeps a delta-0 timer out of the slot being drained on this
        // very tick.
        let slot = (((self.ticks + delta) >> shift) + 1) & self.bucket_mask();
        (level, slot as usize)
    }

    /// Schedules `timer` to expire `lifetime` ticks from now.
    ///
    /// A lifetime of zero is indistinguishable from one: the slot offset
    /// keeps every timer out of the bucket currently being drained, so a
    /// callback rescheduling itself at zero cannot spin. Lifetimes beyond
    /// [`max_lifetime`](Wheel::max_lifetime) are silently clamped to it. A
    /// timer that is already scheduled (on this wheel or another) is moved:
    /// it will fire once, at the time implied by this call.
    ///
    /// # Safety
    ///
    /// The timer must stay pinned at its address for as long as it is
    /// scheduled. The linkage is torn down when the timer fires, is
    /// cancelled, or when either the timer or the wheel is dropped; until
    /// one of those happens the caller must not invalidate it by other
    /// means, and must not drop the timer from inside its own expiry
    /// callback.
    pub unsafe fn schedule(&mut self, lifetime: TickSpan, timer: Pin<&Timer<T>>) {
        let (level, slot) = self.placement(lifetime.get());
        let node = timer.node();
        // Unlink first so rescheduling moves the timer instead of
        // double-linking it.
        unsafe { node.as_ref() }.unlink();
        trace!(lifetime = lifetime.get(), lvl = level, slot, "schedule");
        self.buckets[self.bucket_index(level, slot)].push_back(node);
    }

    /// Advances the wheel by one tick, firing every due timer.
    ///
    /// Returns the number of timers fired.
    pub fn tick(&mut self) -> usize {
        self.tick_with_limit(usize::MAX)
    }

    /// Advances the wheel by one tick, firing at most `limit` timers.
    ///
    /// Due timers beyond the limit are not lost: they are carried onto the
    /// level-0 bucket that expires on the next tick. Returns the number of
    /// timers fired.
    pub fn tick_with_limit(&mut self, limit: usize) -> usize {
        let cur = self.ticks;
        // Advance up front: expiry callbacks that reschedule must see the
        // new now.
        self.ticks = cur + 1;
        let mask = self.bucket_mask();
        let mut fired = 0;
        {
            let carry = NonNull::from(&self.buckets[(self.ticks & mask) as usize]);
            let drained = Drain::new(carry);
            let granularity_mask = self.granularity_mask();
            let mut level_ticks = cur;
            for level in 0..self.levels {
                let slot = (level_ticks & mask) as usize;
                let bucket = NonNull::from(&self.buckets[self.bucket_index(level, slot)]);
                // Drain the whole bucket before firing anything: callbacks
                // may reschedule into this very bucket.
                // SAFETY: the bucket slab is heap-stable and only accessed
                // through shared references here.
                drained.list.splice_back(unsafe { bucket.as_ref() });
                while fired < limit {
                    let Some(node) = drained.list.pop_front() else {
                        break;
                    };
                    // SAFETY: every node linked into this wheel belongs to a
                    // live, pinned `Timer<T>` per `schedule`'s contract, and
                    // `pop_front` unlinked it before we fire.
                    let timer = unsafe { Pin::new_unchecked(Timer::<T>::from_node(node).as_ref()) };
                    let expire = timer.expire_fn();
                    expire(ExpiryScope { wheel: &mut *self }, timer);
                    fired += 1;
                }
                // A level boundary is crossed only when every lower index
                // digit rolled over.
                if level_ticks & granularity_mask != 0 {
                    break;
                }
                level_ticks >>= self.granularity_bits;
                if level + 1 < self.levels {
                    debug!(tick = cur, lvl = level + 1, "cascade");
                }
            }
            // `drained` drops here; leftovers (fire limit reached, or a
            // callback panicked) are carried to the next tick's level-0
            // bucket.
        }
        self.max_fired_per_tick = self.max_fired_per_tick.max(fired);
        fired
    }

    /// Advances the wheel by `ticks` individual ticks.
    ///
    /// Returns the total number of timers fired.
    pub fn tick_many(&mut self, ticks: u64) -> usize {
        let mut fired = 0;
        for _ in 0..ticks {
            fired += self.tick();
        }
        fired
    }

    /// Advances the wheel by up to `ticks` ticks with a cumulative cap on
    /// expirations.
    ///
    /// Stops early once `limit` timers have fired; the tick counter does not
    /// advance past the tick that exhausted the cap. Returns the total
    /// number of timers fired.
    pub fn tick_many_with_limit(&mut self, ticks: u64, limit: usize) -> usize {
        let mut fired = 0;
        for _ in 0..ticks {
            if fired >= limit {
                break;
            }
            fired += self.tick_with_limit(limit - fired);
        }
        fired
    }
}

impl<T> Drop for Wheel<T> {
    fn drop(&mut self) {
        // A timer outliving its wheel must end up unscheduled, not holding a
        // pointer into freed bucket storage.
        for bucket in &*self.buckets {
            while bucket.pop_front().is_some() {}
        }
    }
}

impl<T> core::fmt::Debug for Wheel<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Wheel")
            .field("ticks", &self.ticks)
            .field("levels", &self.levels)
            .field("bucket_count", &self.bucket_count())
            .field("max_lifetime", &self.max_lifetime)
            .finish()
    }
}

/// What an expiry callback is allowed to do with its wheel.
///
/// The scope exposes rescheduling and read-only queries but not the tick
/// entry points, so a callback can never re-enter expiry processing.
pub struct ExpiryScope<'w, T> {
    wheel: &'w mut Wheel<T>,
}

impl<T> ExpiryScope<'_, T> {
    /// Schedules a timer from inside an expiry callback, including the one
    /// currently firing.
    ///
    /// # Safety
    ///
    /// Same contract as [`Wheel::schedule`].
    pub unsafe fn schedule(&mut self, lifetime: TickSpan, timer: Pin<&Timer<T>>) {
        unsafe { self.wheel.schedule(lifetime, timer) }
    }

    /// The current position on the tick lattice, as seen by callbacks: the
    /// tick being processed has already been counted.
    #[inline]
    #[must_use]
    pub fn now(&self) -> TickInstant {
        self.wheel.now()
    }

    /// The largest schedulable lifetime.
    #[inline]
    #[must_use]
    pub fn max_lifetime(&self) -> TickSpan {
        self.wheel.max_lifetime()
    }
}

/// Stack-local expiry staging.
///
/// Holds the timers drained from due buckets while callbacks run. On drop
/// (normal exit with the fire limit reached, or an unwinding callback) any
/// timers still staged are spliced onto the carry bucket so they fire on the
/// very next tick instead of being lost on a dead stack frame. Carried
/// timers precede that bucket's own entries; they were due first.
struct Drain {
    list: List,
    carry: NonNull<List>,
}

impl Drain {
    fn new(carry: NonNull<List>) -> Self {
        Self {
            list: List::new(),
            carry,
        }
    }
}

impl Drop for Drain {
    fn drop(&mut self) {
        if self.list.is_empty() {
            return;
        }
        // SAFETY: `carry` points into the wheel's heap-stable bucket slab,
        // which outlives this guard.
        unsafe { self.carry.as_ref() }.splice_front(&self.list);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use std::rc::Rc;

    type Fired = Rc<Cell<u32>>;

    fn count(_scope: ExpiryScope<'_, Fired>, timer: Pin<&Timer<Fired>>) {
        timer.data().set(timer.data().get() + 1);
    }

    fn wheel<T>(levels: usize, bucket_bits: u32, granularity_bits: u32) -> Wheel<T> {
        Wheel::new(WheelConfig {
            levels: NonZeroUsize::new(levels).unwrap(),
            bucket_bits: NonZeroU32::new(bucket_bits).unwrap(),
            granularity_bits,
        })
        .unwrap()
    }

    fn counter_timer() -> (Fired, Pin<Box<Timer<Fired>>>) {
        let fired: Fired = Rc::new(Cell::new(0));
        (fired.clone(), Box::pin(Timer::new(fired, count)))
    }

    #[test]
    fn config_rejects_coarse_granularity() {
        let err = Wheel::<Fired>::new(WheelConfig {
            levels: NonZeroUsize::new(2).unwrap(),
            bucket_bits: NonZeroU32::new(3).unwrap(),
            granularity_bits: 4,
        })
        .unwrap_err();
        assert_eq!(
            err,
            WheelError::GranularityTooCoarse {
                granularity_bits: 4,
                bucket_bits: 3
            }
        );
    }

    #[test]
    fn config_rejects_oversized_geometry() {
        let err = Wheel::<Fired>::new(WheelConfig {
            levels: NonZeroUsize::new(9).unwrap(),
            bucket_bits: NonZeroU32::new(8).unwrap(),
            granularity_bits: 8,
        })
        .unwrap_err();
        assert!(matches!(err, WheelError::GeometryOverflow { required_bits } if required_bits == 72));
    }

    #[test]
    fn max_lifetime_matches_geometry() {
        // Three levels of 32 buckets with an 8x step: top granule is 64
        // ticks, reach 31 * 64, minus one granule.
        assert_eq!(wheel::<Fired>(3, 5, 3).max_lifetime(), TickSpan::new(1920));
        assert_eq!(wheel::<Fired>(1, 5, 3).max_lifetime(), TickSpan::new(30));
    }

    #[test]
    fn zero_lifetime_acts_like_one() {
        // The slot offset keeps a zero-lifetime timer out of the bucket
        // being drained, so it lands with the lifetime-1 timers.
        let mut w = wheel(1, 5, 3);
        let (fired, timer) = counter_timer();
        unsafe { w.schedule(TickSpan::ZERO, timer.as_ref()) };
        assert!(timer.is_scheduled());
        assert_eq!(w.tick(), 0);
        assert_eq!(w.tick(), 1);
        assert_eq!(fired.get(), 1);
        assert!(!timer.is_scheduled());
    }

    #[test]
    fn level_zero_fires_exactly_on_deadline() {
        let mut w = wheel(3, 5, 3);
        let (fired, timer) = counter_timer();
        unsafe { w.schedule(TickSpan::new(9), timer.as_ref()) };
        assert_eq!(w.tick_many(9), 0);
        assert_eq!(fired.get(), 0);
        assert_eq!(w.tick(), 1);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn fifo_within_a_bucket() {
        let mut w = wheel(1, 5, 3);
        let order: Rc<Cell<u32>> = Rc::new(Cell::new(0));
        fn record(_scope: ExpiryScope<'_, (Fired, u32)>, timer: Pin<&Timer<(Fired, u32)>>) {
            let (order, rank) = timer.data();
            // Encode arrival order: each timer must see the count of its
            // predecessors.
            assert_eq!(order.get(), *rank);
            order.set(order.get() + 1);
        }
        let timers: Vec<_> = (0..4)
            .map(|rank| Box::pin(Timer::new((order.clone(), rank), record)))
            .collect();
        for timer in &timers {
            unsafe { w.schedule(TickSpan::new(3), timer.as_ref()) };
        }
        assert_eq!(w.tick_many(4), 4);
        assert_eq!(order.get(), 4);
    }

    #[test]
    fn reschedule_moves_the_timer() {
        let mut w = wheel(1, 5, 3);
        let (fired, timer) = counter_timer();
        unsafe { w.schedule(TickSpan::new(5), timer.as_ref()) };
        unsafe { w.schedule(TickSpan::new(10), timer.as_ref()) };
        assert_eq!(w.tick_many(6), 0);
        assert_eq!(w.tick_many(5), 1);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn limit_carries_overflow_to_next_tick() {
        let mut w = wheel(1, 5, 3);
        let timers: Vec<_> = (0..10).map(|_| counter_timer()).collect();
        for (_, timer) in &timers {
            unsafe { w.schedule(TickSpan::new(4), timer.as_ref()) };
        }
        assert_eq!(w.tick_many(4), 0);
        assert_eq!(w.tick_with_limit(3), 3);
        // The seven carried timers fire on the very next tick.
        assert_eq!(w.tick(), 7);
        let total: u32 = timers.iter().map(|(fired, _)| fired.get()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn tick_with_limit_zero_defers_everything() {
        let mut w = wheel(1, 5, 3);
        let (fired, timer) = counter_timer();
        unsafe { w.schedule(TickSpan::new(1), timer.as_ref()) };
        assert_eq!(w.tick(), 0);
        assert_eq!(w.tick_with_limit(0), 0);
        assert_eq!(fired.get(), 0);
        assert_eq!(w.tick(), 1);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn tick_many_with_limit_stops_early() {
        let mut w = wheel(1, 5, 3);
        let timers: Vec<_> = (0..6).map(|_| counter_timer()).collect();
        for (_, timer) in &timers {
            unsafe { w.schedule(TickSpan::new(1), timer.as_ref()) };
        }
        // The cap is reached on the second tick; the remaining ticks are
        // not performed.
        assert_eq!(w.tick_many_with_limit(10, 4), 4);
        assert_eq!(w.now(), TickInstant::new(2));
        assert_eq!(w.tick(), 2);
    }

    #[test]
    fn wheel_drop_unschedules_timers() {
        let (fired, timer) = counter_timer();
        {
            let mut w = wheel(2, 4, 2);
            unsafe { w.schedule(TickSpan::new(100), timer.as_ref()) };
            assert!(timer.is_scheduled());
        }
        assert!(!timer.is_scheduled());
        timer.cancel();
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn timer_drop_cancels() {
        let mut w = wheel(1, 5, 3);
        let (fired, timer) = counter_timer();
        unsafe { w.schedule(TickSpan::new(2), timer.as_ref()) };
        drop(timer);
        assert_eq!(w.tick_many(40), 0);
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn max_fired_per_tick_high_water() {
        let mut w = wheel(1, 5, 3);
        let timers: Vec<_> = (0..5).map(|_| counter_timer()).collect();
        for (_, timer) in &timers {
            unsafe { w.schedule(TickSpan::new(2), timer.as_ref()) };
        }
        w.tick_many(3);
        assert_eq!(w.max_fired_per_tick(), 5);
    }

    #[test]
    fn callback_panic_carries_undrained_timers() {
        fn explode(_scope: ExpiryScope<'_, Fired>, timer: Pin<&Timer<Fired>>) {
            timer.data().set(timer.data().get() + 1);
            panic!("expiry failure");
        }
        let mut w = wheel(1, 5, 3);
        let bomb_fired: Fired = Rc::new(Cell::new(0));
        let bomb = Box::pin(Timer::new(bomb_fired.clone(), explode));
        let (fired, survivor) = counter_timer();
        unsafe { w.schedule(TickSpan::new(2), bomb.as_ref()) };
        unsafe { w.schedule(TickSpan::new(2), survivor.as_ref()) };
        w.tick_many(2);
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            w.tick();
        }));
        assert!(panicked.is_err());
        assert_eq!(bomb_fired.get(), 1);
        // The survivor was staged behind the panicking timer; it must fire
        // on the next tick, not vanish.
        assert_eq!(fired.get(), 0);
        assert!(survivor.is_scheduled());
        assert_eq!(w.tick(), 1);
        assert_eq!(fired.get(), 1);
    }
}
