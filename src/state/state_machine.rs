use std::time::Instant;

use thiserror::Error;
use uuid::Uuid;

use crate::state::item::Feature;

/// High-level phases a session can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No authoritative state yet; waiting for restore data or the first live event.
    Awaiting,
    /// Live battle sub-phase.
    Battle(BattlePhase),
    /// Mock-test sub-phase.
    MockTest(MockPhase),
}

/// Phases of a live battle, cycling once per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BattlePhase {
    /// An item is open for answers.
    Question,
    /// Aggregate counts and the correct option are shown.
    Results,
    /// Ranked participants are shown.
    Leaderboard,
    /// Terminal.
    Ended,
}

/// Phases of a mock-test attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockPhase {
    /// Working through the items of the loaded section.
    InProgress,
    /// Last item of the section reached; waiting for review/advance/finish.
    SectionBoundary,
    /// Terminal.
    Completed,
}

impl SessionPhase {
    /// No event may leave a terminal phase.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Battle(BattlePhase::Ended) | SessionPhase::MockTest(MockPhase::Completed)
        )
    }

    /// Whether the correct option may be shown to the participant.
    pub fn authorizes_reveal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Battle(BattlePhase::Results)
                | SessionPhase::Battle(BattlePhase::Leaderboard)
                | SessionPhase::Battle(BattlePhase::Ended)
        )
    }

    /// Terminal phase for the given feature.
    pub fn terminal_for(feature: Feature) -> Self {
        match feature {
            Feature::Battle => SessionPhase::Battle(BattlePhase::Ended),
            Feature::MockTest => SessionPhase::MockTest(MockPhase::Completed),
        }
    }
}

/// Events that can be applied to the phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Authoritative state loaded on entry; may re-enter any non-terminal phase.
    Restore(SessionPhase),
    /// A new battle item was broadcast.
    NewItem,
    /// The current item was broadcast again with an explicit repeat marker.
    RepeatItem,
    /// Results for the current item were revealed.
    RevealResults,
    /// The leaderboard was broadcast.
    UpdateLeaderboard,
    /// The session ended (battle) or the attempt has no more sections (mock test).
    SessionEnd,
    /// A mock-test section batch was loaded.
    SectionLoaded,
    /// Last item of the section submitted.
    SectionEndReached,
    /// Review the current section from the boundary.
    ReviewSection,
    /// Advance from the boundary to the next section.
    AdvanceSection,
    /// Finish the attempt from the boundary.
    Finish,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the machine was in when the invalid event was received.
    pub from: SessionPhase,
    /// The event that cannot be applied from this phase.
    pub event: PhaseEvent,
}

/// Errors that can occur when planning a transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// A transition is already pending and must be applied or aborted.
    #[error("a transition is already pending")]
    AlreadyPending,
    /// The requested transition is not valid from the current phase.
    #[error(transparent)]
    InvalidTransition(InvalidTransition),
}

/// Errors that can occur when applying a planned transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// No transition is currently pending.
    #[error("no transition is pending")]
    NoPending,
    /// Plan ID does not match the pending plan.
    #[error("plan {got} does not match pending plan {expected}")]
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
    /// Phase changed since the plan was created.
    #[error("phase moved from {expected:?} to {actual:?} since the plan was made")]
    PhaseMismatch {
        /// Phase when plan was created.
        expected: SessionPhase,
        /// Current phase.
        actual: SessionPhase,
    },
    /// Version changed since the plan was created.
    #[error("version moved from {expected} to {actual} since the plan was made")]
    VersionMismatch {
        /// Version when plan was created.
        expected: usize,
        /// Current version.
        actual: usize,
    },
}

/// Errors that can occur when aborting a planned transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortError {
    /// No transition is currently pending.
    #[error("no transition is pending")]
    NoPending,
    /// Plan ID does not match the pending plan.
    #[error("plan {got} does not match pending plan {expected}")]
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
}

/// Unique identifier for a planned transition.
pub type PlanId = Uuid;

/// A transition that has been validated but not yet applied.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Unique identifier for this plan.
    pub id: PlanId,
    /// Phase the machine is currently in.
    pub from: SessionPhase,
    /// Phase the machine will transition to.
    pub to: SessionPhase,
    /// Event that triggered this transition.
    pub event: PhaseEvent,
    /// Version number after applying this transition.
    pub version_next: usize,
    /// Timestamp when this plan was created.
    pub pending_since: Instant,
}

/// Snapshot of the machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Current phase.
    pub phase: SessionPhase,
    /// Increments on each applied transition.
    pub version: usize,
    /// Target phase of a pending plan.
    pub pending: Option<SessionPhase>,
}

/// Phase machine for one session of the given feature.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    feature: Feature,
    phase: SessionPhase,
    version: usize,
    pending: Option<Plan>,
}

impl PhaseMachine {
    /// Create a machine in [`SessionPhase::Awaiting`].
    pub fn new(feature: Feature) -> Self {
        Self {
            feature,
            phase: SessionPhase::Awaiting,
            version: 0,
            pending: None,
        }
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Feature this machine was built for.
    pub fn feature(&self) -> Feature {
        self.feature
    }

    /// Whether a planned transition awaits apply/abort.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Create a snapshot of the machine state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase,
            version: self.version,
            pending: self.pending.as_ref().map(|plan| plan.to),
        }
    }

    /// Validate `event` against the current phase and reserve the transition.
    pub fn plan(&mut self, event: PhaseEvent) -> Result<Plan, PlanError> {
        if self.pending.is_some() {
            return Err(PlanError::AlreadyPending);
        }

        let next = self
            .compute_transition(event)
            .map_err(PlanError::InvalidTransition)?;

        let plan = Plan {
            id: Uuid::new_v4(),
            from: self.phase,
            to: next,
            event,
            version_next: self.version + 1,
            pending_since: Instant::now(),
        };

        self.pending = Some(plan.clone());

        Ok(plan)
    }

    /// Apply a planned transition, returning the new phase.
    pub fn apply(&mut self, plan_id: PlanId) -> Result<SessionPhase, ApplyError> {
        let plan = self.pending.take().ok_or(ApplyError::NoPending)?;

        if plan.id != plan_id {
            let expected_plan_id = plan.id;
            self.pending = Some(plan);
            return Err(ApplyError::IdMismatch {
                expected: expected_plan_id,
                got: plan_id,
            });
        }

        if self.phase != plan.from {
            return Err(ApplyError::PhaseMismatch {
                expected: plan.from,
                actual: self.phase,
            });
        }

        if self.version + 1 != plan.version_next {
            return Err(ApplyError::VersionMismatch {
                expected: plan.version_next,
                actual: self.version + 1,
            });
        }

        self.phase = plan.to;
        self.version = plan.version_next;

        Ok(self.phase)
    }

    /// Abort a planned transition, leaving the phase untouched.
    pub fn abort(&mut self, plan_id: PlanId) -> Result<(), AbortError> {
        let plan = self.pending.as_ref().ok_or(AbortError::NoPending)?;

        if plan.id != plan_id {
            return Err(AbortError::IdMismatch {
                expected: plan.id,
                got: plan_id,
            });
        }

        self.pending = None;
        Ok(())
    }

    /// Drop whatever plan is pending, returning it.
    pub fn abort_pending(&mut self) -> Option<Plan> {
        self.pending.take()
    }

    /// Plan and apply in one step, for transitions with no remote work attached.
    pub fn transition(&mut self, event: PhaseEvent) -> Result<SessionPhase, PlanError> {
        let plan = self.plan(event)?;
        self.apply(plan.id).map_err(|_| {
            PlanError::InvalidTransition(InvalidTransition {
                from: plan.from,
                event,
            })
        })
    }

    /// Compute a transition from an event if the transition is valid.
    fn compute_transition(&self, event: PhaseEvent) -> Result<SessionPhase, InvalidTransition> {
        use BattlePhase as B;
        use MockPhase as M;
        use SessionPhase as P;

        let invalid = || InvalidTransition {
            from: self.phase,
            event,
        };

        if self.phase.is_terminal() {
            return Err(invalid());
        }

        let next = match (self.feature, self.phase, event) {
            (_, _, PhaseEvent::SessionEnd) => SessionPhase::terminal_for(self.feature),
            (Feature::Battle, _, PhaseEvent::Restore(target @ P::Battle(_)))
            | (Feature::MockTest, _, PhaseEvent::Restore(target @ P::MockTest(_))) => target,

            (
                Feature::Battle,
                P::Awaiting | P::Battle(B::Question | B::Results | B::Leaderboard),
                PhaseEvent::NewItem,
            ) => P::Battle(B::Question),
            (Feature::Battle, P::Battle(B::Results | B::Leaderboard), PhaseEvent::RepeatItem) => {
                P::Battle(B::Question)
            }
            (Feature::Battle, P::Battle(B::Question), PhaseEvent::RevealResults) => {
                P::Battle(B::Results)
            }
            (
                Feature::Battle,
                P::Awaiting | P::Battle(B::Question | B::Results),
                PhaseEvent::UpdateLeaderboard,
            ) => P::Battle(B::Leaderboard),

            (
                Feature::MockTest,
                P::Awaiting | P::MockTest(M::InProgress),
                PhaseEvent::SectionLoaded,
            ) => P::MockTest(M::InProgress),
            (Feature::MockTest, P::MockTest(M::InProgress), PhaseEvent::SectionEndReached) => {
                P::MockTest(M::SectionBoundary)
            }
            (Feature::MockTest, P::MockTest(M::SectionBoundary), PhaseEvent::ReviewSection) => {
                P::MockTest(M::InProgress)
            }
            (Feature::MockTest, P::MockTest(M::SectionBoundary), PhaseEvent::AdvanceSection) => {
                P::MockTest(M::InProgress)
            }
            (
                Feature::MockTest,
                P::MockTest(M::InProgress | M::SectionBoundary),
                PhaseEvent::Finish,
            ) => P::MockTest(M::Completed),
            _ => return Err(invalid()),
        };

        Ok(next)
    }
}
