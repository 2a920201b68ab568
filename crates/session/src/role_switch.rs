//! Hold-to-switch-role state machine for one connection.
//!
//! A 5-finger reset tap arms the switch. The peer then puts down N fingers
//! (each within [`RESET_WAIT`] of the previous one) and holds them for
//! [`RESET_HOLD`]. The connection asks for role `N - 1`.
//!
//! ```text
//! Idle --arm--> Armed(at) --down--> Holding(last_down) --held ≥ RESET_HOLD--> fire
//!                  |                     |
//!                  +--RESET_WAIT---------+--release / late down--> Idle
//! ```

use std::time::Duration;

use navi_wire::TouchPhase;
use tracing::debug;

use crate::connection::Role;

/// Window for the first and each following finger-down.
pub const RESET_WAIT: Duration = Duration::from_secs(2);

/// How long the fingers must stay down before the switch fires.
pub const RESET_HOLD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoleSwitch {
    #[default]
    Idle,
    /// Armed by a reset tap, waiting for the first finger.
    Armed { since: Duration },
    /// Fingers going down, last one at `last_down`.
    Holding { last_down: Duration },
}

/// Result of feeding one touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    Pending,
    Cancelled,
    SwitchTo(Role),
}

impl RoleSwitch {
    pub fn arm(&mut self, now: Duration) {
        *self = Self::Armed { since: now };
    }

    pub fn is_eligible(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    pub fn clear(&mut self) {
        *self = Self::Idle;
    }

    /// Drop an armed switch nobody followed up on.
    pub fn expire(&mut self, now: Duration) {
        if let Self::Armed { since } = *self
            && now.saturating_sub(since) > RESET_WAIT
        {
            debug!("role switch window elapsed");
            *self = Self::Idle;
        }
    }

    /// Feed one touch. `fingers_down` is the count after this touch was applied.
    pub fn on_touch(&mut self, phase: TouchPhase, fingers_down: u32, now: Duration) -> SwitchOutcome {
        self.expire(now);
        match (*self, phase) {
            (Self::Idle, _) => SwitchOutcome::Pending,

            (Self::Armed { since }, TouchPhase::Began) => self.next_down(since, now),
            // The release of the arming tap itself.
            (Self::Armed { .. }, _) => SwitchOutcome::Pending,

            (Self::Holding { last_down }, TouchPhase::Began) => self.next_down(last_down, now),
            (Self::Holding { .. }, TouchPhase::Ended | TouchPhase::Canceled) => {
                debug!("finger released before hold completed");
                self.cancel()
            }
            (Self::Holding { last_down }, TouchPhase::Stationary | TouchPhase::Moved) => {
                if now.saturating_sub(last_down) < RESET_HOLD || fingers_down == 0 {
                    return SwitchOutcome::Pending;
                }
                *self = Self::Idle;
                // fingers_down is bounded by the gesture counter's reset at 15.
                SwitchOutcome::SwitchTo((fingers_down - 1) as Role)
            }
        }
    }

    fn next_down(&mut self, previous: Duration, now: Duration) -> SwitchOutcome {
        if now.saturating_sub(previous) > RESET_WAIT {
            debug!("finger-down cadence too slow for role switch");
            return self.cancel();
        }
        *self = Self::Holding { last_down: now };
        SwitchOutcome::Pending
    }

    fn cancel(&mut self) -> SwitchOutcome {
        *self = Self::Idle;
        SwitchOutcome::Cancelled
    }
}
