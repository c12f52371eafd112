//! Millisecond ticks for expiration timers.
//!
//! All timeouts in the worker are expressed as *ticks*: 32-bit millisecond
//! dates relative to the worker clock. Ticks wrap, so two ticks are ordered
//! by the sign of their wrapping difference, which gives a usable window of
//! about 24.8 days in each direction. The value `u32::MAX` is reserved as
//! the *eternity* sentinel meaning "never expires"; [`tick_add`] skips over
//! it so an arithmetic result is never mistaken for eternity.

/// A tick is a wrapping millisecond date. `TICK_ETERNITY` never expires.
pub type Tick = u32;

/// The "never expires" sentinel.
pub const TICK_ETERNITY: Tick = u32::MAX;

/// Upper bound on a single poller wait, in milliseconds.
///
/// Keeping waits short bounds how stale the clock can get between updates
/// and lets the drift-correction logic distinguish a long poll from a
/// wall-clock jump.
pub const MAX_DELAY_MS: u32 = 1000;

/// Returns true unless the tick is the eternity sentinel.
#[inline]
#[must_use]
pub const fn tick_isset(t: Tick) -> bool {
    t != TICK_ETERNITY
}

/// Adds `ms` to `base`, wrapping, and skipping the eternity value.
#[inline]
#[must_use]
pub const fn tick_add(base: Tick, ms: u32) -> Tick {
    let t = base.wrapping_add(ms);
    if t == TICK_ETERNITY {
        t.wrapping_add(1)
    } else {
        t
    }
}

/// Adds `ms` to `base` if `ms` is set, otherwise returns eternity.
///
/// A timeout of `None` means the corresponding timer is disabled.
#[inline]
#[must_use]
pub const fn tick_add_ifset(base: Tick, ms: Option<u32>) -> Tick {
    match ms {
        Some(ms) => tick_add(base, ms),
        None => TICK_ETERNITY,
    }
}

/// True iff `t1` is strictly before `t2`. Neither may be eternity.
#[inline]
#[must_use]
pub const fn tick_is_lt(t1: Tick, t2: Tick) -> bool {
    (t1.wrapping_sub(t2) as i32) < 0
}

/// True iff `exp` is set and has passed at date `now`.
#[inline]
#[must_use]
pub const fn tick_is_expired(exp: Tick, now: Tick) -> bool {
    tick_isset(exp) && (now.wrapping_sub(exp) as i32) >= 0
}

/// Returns the earlier of two ticks, ignoring eternity.
#[inline]
#[must_use]
pub const fn tick_first(t1: Tick, t2: Tick) -> Tick {
    if !tick_isset(t1) {
        return t2;
    }
    if !tick_isset(t2) {
        return t1;
    }
    if tick_is_lt(t1, t2) {
        t1
    } else {
        t2
    }
}

/// Milliseconds remaining from `now` until `exp`, clamped at zero.
/// Returns `None` when `exp` is eternity.
#[inline]
#[must_use]
pub const fn tick_remain(now: Tick, exp: Tick) -> Option<u32> {
    if !tick_isset(exp) {
        return None;
    }
    let d = exp.wrapping_sub(now);
    if (d as i32) <= 0 {
        Some(0)
    } else {
        Some(d)
    }
}
