//! Bus pacing, backoff and recovery.
//!
//! A [`PacingController`] represents one physical bus. It owns the transport
//! and is the only way onto the bus: every exchange, from any session, goes
//! through [`PacingController::acquire`]. Loads fed commands faster than they
//! can parse them lose sync and stay that way until the bus goes quiet, so the
//! controller spaces exchanges out and escalates repeated failures into a
//! bus-wide recovery pause.

use core::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};
use std::sync::{Mutex, MutexGuard, PoisonError};

use fugit::{MillisDurationU64, TimerInstantU64};
use tracing::{debug, warn};

use crate::{address::DeviceAddress, types::BaudRate};

/// Millisecond resolution instant on a [`BusClock`].
pub type BusInstant = TimerInstantU64<1000>;

/// Millisecond resolution duration on a [`BusClock`].
pub type BusDuration = MillisDurationU64;

/// Extra settling time on top of the frame time between exchanges.
const SETTLE_MS: u64 = 10;

/// Largest accepted [`PacingConfig::retry_ceiling`].
pub const MAX_RETRY_CEILING: u8 = 16;

/// Source of time for pacing. Swapped out in tests.
pub trait BusClock {
    /// Current time.
    fn now(&self) -> BusInstant;

    /// Block the calling thread for `duration`.
    fn pause(&self, duration: BusDuration);
}

/// [`BusClock`] backed by the system's monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: std::time::Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl BusClock for StdClock {
    fn now(&self) -> BusInstant {
        let elapsed = self.origin.elapsed().as_millis();
        BusInstant::from_ticks(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }

    fn pause(&self, duration: BusDuration) {
        std::thread::sleep(std::time::Duration::from_millis(duration.to_millis()));
    }
}

/// Timing of one bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    /// Minimum gap between the end of one exchange and the start of the next.
    pub inter_command_delay: BusDuration,
    /// Backoff before the first retry. Doubles with every further failure.
    pub backoff_base: BusDuration,
    /// Upper bound of the backoff.
    pub backoff_max: BusDuration,
    /// How long the bus is kept quiet once a load has failed too often.
    pub recovery_pause: BusDuration,
    /// Consecutive failures tolerated before recovering instead of retrying.
    /// Clamped to [`MAX_RETRY_CEILING`] by the controller.
    pub retry_ceiling: u8,
}

impl PacingConfig {
    /// Timing for a bus running at `baud_rate`.
    pub const fn for_baud_rate(baud_rate: BaudRate) -> Self {
        Self {
            inter_command_delay: BusDuration::millis(baud_rate.frame_time_ms() + SETTLE_MS),
            backoff_base: BusDuration::millis(100),
            backoff_max: BusDuration::millis(1_000),
            recovery_pause: BusDuration::millis(3_000),
            retry_ceiling: 3,
        }
    }

    /// Capped exponential backoff before retry number `consecutive`.
    ///
    /// Never decreases as `consecutive` grows and never exceeds `backoff_max`.
    pub fn backoff_delay(&self, consecutive: u8) -> BusDuration {
        if consecutive == 0 {
            return BusDuration::from_ticks(0);
        }
        let factor = 1u64
            .checked_shl(u32::from(consecutive) - 1)
            .unwrap_or(u64::MAX);
        let ticks = self
            .backoff_base
            .ticks()
            .saturating_mul(factor)
            .min(self.backoff_max.ticks());
        BusDuration::from_ticks(ticks)
    }
}

impl Default for PacingConfig {
    /// Tuned to 4800 baud, the slowest supported rate.
    fn default() -> Self {
        Self::for_baud_rate(BaudRate::_4800)
    }
}

/// What a session should do after a failed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Wait this long, then send the same frame again.
    Retry(BusDuration),
    /// Give up on the command and keep the bus quiet this long.
    Recover(BusDuration),
}

/// Counters for one bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusStats {
    /// Times the bus was acquired.
    pub exchanges: u32,
    /// Exchange units which completed.
    pub successes: u32,
    /// Failed exchanges, of any kind.
    pub failures: u32,
    /// Recovery pauses started.
    pub recoveries: u32,
}

#[derive(Debug, Default)]
struct Counters {
    exchanges: AtomicU32,
    successes: AtomicU32,
    failures: AtomicU32,
    recoveries: AtomicU32,
}

struct BusState<S> {
    transport: S,
    last_release: Option<BusInstant>,
    quiet_until: Option<BusInstant>,
}

/// The single gate onto one physical bus.
///
/// Share it by reference between every [`LoadSession`](crate::session::LoadSession)
/// on the bus. It is `Sync` when the transport is `Send`, so sessions may live
/// on different threads.
pub struct PacingController<S, C = StdClock> {
    bus: Mutex<BusState<S>>,
    clock: C,
    config: PacingConfig,
    counters: Counters,
}

impl<S: embedded_io::Read + embedded_io::Write> PacingController<S> {
    /// Take ownership of the transport for a bus.
    pub fn new(transport: S, config: PacingConfig) -> Self {
        Self::with_clock(transport, config, StdClock::new())
    }
}

impl<S: embedded_io::Read + embedded_io::Write, C: BusClock> PacingController<S, C> {
    pub fn with_clock(transport: S, mut config: PacingConfig, clock: C) -> Self {
        if config.retry_ceiling > MAX_RETRY_CEILING {
            warn!(
                retry_ceiling = config.retry_ceiling,
                max = MAX_RETRY_CEILING,
                "retry ceiling clamped"
            );
            config.retry_ceiling = MAX_RETRY_CEILING;
        }
        Self {
            bus: Mutex::new(BusState {
                transport,
                last_release: None,
                quiet_until: None,
            }),
            clock,
            config,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            exchanges: self.counters.exchanges.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            recoveries: self.counters.recoveries.load(Ordering::Relaxed),
        }
    }

    /// Wait for the bus, then hold it until the returned guard is dropped.
    ///
    /// Blocks while another exchange is in flight, until the inter-command
    /// delay since the last exchange has passed, and until any recovery pause
    /// has ended.
    pub fn acquire(&self) -> BusGuard<'_, S, C> {
        let state = self.bus.lock().unwrap_or_else(PoisonError::into_inner);

        let mut ready_at = state.last_release.map(|t| t + self.config.inter_command_delay);
        if let Some(quiet_until) = state.quiet_until {
            ready_at = Some(ready_at.map_or(quiet_until, |t| t.max(quiet_until)));
        }
        if let Some(wait) = ready_at.and_then(|t| t.checked_duration_since(self.clock.now())) {
            if wait.ticks() > 0 {
                self.clock.pause(wait);
            }
        }

        self.counters.exchanges.fetch_add(1, Ordering::Relaxed);
        BusGuard {
            state,
            clock: &self.clock,
        }
    }

    /// Record a failed exchange for the load at `address`, its `consecutive`
    /// failure in a row, and get the next step.
    ///
    /// The count is kept by the caller's session, so one load's failures never
    /// move a sibling towards recovery.
    pub fn record_failure(&self, address: DeviceAddress, consecutive: u8) -> Escalation {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        if consecutive > self.config.retry_ceiling {
            self.counters.recoveries.fetch_add(1, Ordering::Relaxed);
            warn!(
                address = %address,
                consecutive,
                pause_ms = self.config.recovery_pause.to_millis(),
                "load stopped responding, quieting the bus"
            );
            Escalation::Recover(self.config.recovery_pause)
        } else {
            let delay = self.config.backoff_delay(consecutive);
            debug!(address = %address, consecutive, delay_ms = delay.to_millis(), "retrying");
            Escalation::Retry(delay)
        }
    }

    /// Record a good exchange for the load at `address`. The session resets
    /// its own failure count.
    pub fn record_success(&self, address: DeviceAddress) {
        self.counters.successes.fetch_add(1, Ordering::Relaxed);
        debug!(address = %address, "exchange ok");
    }

    /// Block for `duration` without holding the bus.
    pub fn pause(&self, duration: BusDuration) {
        self.clock.pause(duration);
    }

    /// Keep every session off the bus for `duration`, blocking the caller for as long.
    pub fn quiesce(&self, duration: BusDuration) {
        {
            let mut state = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
            let until = self.clock.now() + duration;
            state.quiet_until = Some(state.quiet_until.map_or(until, |t| t.max(until)));
        }
        self.clock.pause(duration);
    }

    /// Release the transport.
    pub fn into_inner(self) -> S {
        self.bus
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .transport
    }
}

/// Exclusive use of the transport. Dropping it ends the exchange.
pub struct BusGuard<'a, S, C: BusClock> {
    state: MutexGuard<'a, BusState<S>>,
    clock: &'a C,
}

impl<S, C: BusClock> Deref for BusGuard<'_, S, C> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.state.transport
    }
}

impl<S, C: BusClock> DerefMut for BusGuard<'_, S, C> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.state.transport
    }
}

impl<S, C: BusClock> Drop for BusGuard<'_, S, C> {
    fn drop(&mut self) {
        self.state.last_release = Some(self.clock.now());
    }
}
