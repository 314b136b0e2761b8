use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use once_cell::sync::OnceCell;
use quanta::Mock;

use crate::Nanos;

pub type Clock = quanta::Clock;

/// Wall clock handle behind every `Nanos::now()` call.
///
/// Production agents use the system clock. Tests that drive the event loop
/// with virtual time install a quanta mock before anything reads the clock.
#[derive(Clone, Debug)]
pub enum WallClock {
    Mocked(Clock),
    System,
}

impl WallClock {
    pub fn raw(&self) -> u64 {
        match self {
            WallClock::Mocked(clock) => clock.raw(),
            WallClock::System => unsafe {
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap_unchecked().as_nanos() as u64
            },
        }
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        Nanos(self.raw())
    }
}

// might be mocked
static GLOBAL_CLOCK: OnceCell<WallClock> = OnceCell::new();

/// Install a controllable mock as the process-wide clock.
///
/// Must run before any other code touches the clock; the returned handle
/// advances time via `increment`.
#[inline]
pub fn init_mock() -> Arc<Mock> {
    let (mock, controller) = Clock::mock();
    let clock = GLOBAL_CLOCK.get_or_init(|| WallClock::Mocked(mock));
    assert_eq!(clock.raw(), 0, "mock clock installed after the clock was already read");
    controller.increment(1);
    controller
}

#[inline]
pub fn wall_clock() -> &'static WallClock {
    GLOBAL_CLOCK.get_or_init(|| WallClock::System)
}
