/// Countdown clock.
pub mod clock;
/// Items, answers and leaderboard rows.
pub mod item;
/// Per-session store.
pub mod session;
mod sse;
/// Phase machine with planned transitions.
pub mod state_machine;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use crate::{
    config::AppConfig,
    dao::{authority::Authority, channel::BroadcastTransport},
    dto::session::SessionView,
    services::{channel_adapter::ChannelRegistry, session_runner::SessionCommand},
};

pub use self::sse::SseHub;
pub use self::state_machine::{AbortError, ApplyError, Plan, PlanError, PlanId, Snapshot};
use self::{
    clock::Clock,
    item::{Feature, ParticipantId, SessionId},
    session::SessionStore,
    sse::SseState,
    state_machine::PhaseMachine,
};

/// Handle to the application state shared by routes and runners.
pub type SharedState = Arc<AppState>;
/// Upper bound for a single remote call attached to a phase transition.
pub const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_secs(5);

/// Token identifying one entry into a session.
///
/// Allocated on every enter; work issued under an older token is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a restored mock-test attempt left off.
///
/// Held until the first section batch is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Resume {
    /// Time left recorded by the authority; the clock carries it across the load.
    pub remaining: Option<i64>,
    /// The attempt was waiting at a section boundary.
    pub at_boundary: bool,
}

/// Everything the single session loop owns: store, clock and phase machine.
#[derive(Debug, Clone)]
pub struct ExamSession {
    /// Items, answers and render-facing values.
    pub store: SessionStore,
    /// Countdown for the current item or section.
    pub clock: Clock,
    /// Phase machine for the session's feature.
    pub machine: PhaseMachine,
    /// Entry this session state belongs to.
    pub generation: Generation,
    /// Set by the first live channel event; restore results are discarded afterwards.
    pub live_seen: bool,
    /// A section load is in flight; only one may run at a time.
    pub section_loading: bool,
    /// Restored position applied to the first installed batch.
    pub resume: Option<Resume>,
}

impl ExamSession {
    /// Fresh session state in the awaiting phase.
    pub fn new(
        session_id: SessionId,
        participant_id: ParticipantId,
        feature: Feature,
        generation: Generation,
    ) -> Self {
        Self {
            store: SessionStore::new(session_id, participant_id, feature),
            clock: Clock::new(),
            machine: PhaseMachine::new(feature),
            generation,
            live_seen: false,
            section_loading: false,
            resume: None,
        }
    }

    /// Battle or mock test.
    pub fn feature(&self) -> Feature {
        self.store.feature()
    }
}

/// Handle the HTTP layer keeps for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    /// Entry the runner was started for.
    pub generation: Generation,
    /// Participant of that entry.
    pub participant_id: ParticipantId,
    /// Battle or mock test.
    pub feature: Feature,
    /// Command queue of the runner.
    pub commands: mpsc::Sender<SessionCommand>,
    /// Latest published view.
    pub view: watch::Receiver<SessionView>,
}

impl SessionHandle {
    /// Whether the runner behind this handle is still accepting commands.
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Central application state shared by the render bridge and the session runners.
pub struct AppState {
    config: Arc<AppConfig>,
    authority: Arc<dyn Authority>,
    channels: Arc<ChannelRegistry>,
    sse: SseState,
    sessions: DashMap<SessionId, SessionHandle>,
    generations: AtomicU64,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(
        config: AppConfig,
        authority: Arc<dyn Authority>,
        transport: Arc<dyn BroadcastTransport>,
    ) -> SharedState {
        let sse_capacity = config.channel.buffer;
        Arc::new(Self {
            config: Arc::new(config),
            authority,
            channels: Arc::new(ChannelRegistry::new(transport)),
            sse: SseState::new(sse_capacity),
            sessions: DashMap::new(),
            generations: AtomicU64::new(0),
        })
    }

    /// Runtime configuration.
    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    /// Client for the remote authority.
    pub fn authority(&self) -> Arc<dyn Authority> {
        Arc::clone(&self.authority)
    }

    /// Registry of upstream channel subscriptions, one per topic.
    pub fn channels(&self) -> Arc<ChannelRegistry> {
        Arc::clone(&self.channels)
    }

    /// Render hub of a session.
    pub fn session_sse(&self, session_id: &SessionId) -> Arc<SseHub> {
        self.sse.hub(session_id)
    }

    /// Drop the render hub of a session that has been left.
    pub fn forget_session_sse(&self, session_id: &SessionId) {
        self.sse.remove(session_id);
    }

    /// Registry of running sessions keyed by their identifier.
    pub fn sessions(&self) -> &DashMap<SessionId, SessionHandle> {
        &self.sessions
    }

    /// Allocate a fresh, strictly increasing generation token.
    pub fn next_generation(&self) -> Generation {
        Generation(self.generations.fetch_add(1, Ordering::SeqCst) + 1)
    }
}
