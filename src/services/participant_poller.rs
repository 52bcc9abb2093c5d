//! Periodic refresh of counters that do not travel on the broadcast channel.

use std::time::Duration;

use rand::Rng;

use crate::state::{
    ExamSession,
    item::Feature,
    state_machine::{BattlePhase, SessionPhase},
};

const JITTER: f64 = 0.2;

/// What one poll tick should query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollPlan {
    /// Query the participant count.
    pub participant_count: bool,
    /// Query the leaderboard.
    pub leaderboard: bool,
}

impl PollPlan {
    /// Nothing to query.
    pub fn is_empty(&self) -> bool {
        !self.participant_count && !self.leaderboard
    }
}

/// `interval` scaled by a random factor in `[0.8, 1.2]` so clients do not poll in lockstep.
pub fn jittered(interval: Duration) -> Duration {
    let factor = rand::rng().random_range((1.0 - JITTER)..=(1.0 + JITTER));
    interval.mul_f64(factor)
}

/// Queries worth issuing for the session's current phase.
pub fn plan(session: &ExamSession) -> PollPlan {
    let phase = session.machine.phase();
    PollPlan {
        participant_count: !phase.is_terminal(),
        leaderboard: session.feature() == Feature::Battle
            && matches!(
                phase,
                SessionPhase::Battle(BattlePhase::Leaderboard | BattlePhase::Ended)
            ),
    }
}
