//! The single cooperative loop that owns one entered session.
//!
//! Clock ticks, channel deliveries, participant commands and remote-call
//! completions are all processed here, one at a time, in arrival order.
//! Remote calls run as tasks tagged with the session generation; their
//! results come back into the loop and are discarded when stale.

use std::{future::Future, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinError, JoinSet},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    dao::authority::{Authority, AuthorityError, AuthorityResult},
    dto::{
        events::{ChannelEvent, EventKind},
        section::SectionRequest,
        session::{BoundaryChoice, SessionView},
    },
    error::ServiceError,
    services::{
        answer_submitter,
        channel_adapter::{Delivery, FrameFilter},
        participant_poller, phase_controller,
        phase_controller::{Effect, Outcome, SectionPurpose},
        restore_loader, section_navigator, sse_events,
    },
    state::{
        DEFAULT_TRANSITION_TIMEOUT, ExamSession, Generation, PlanId, SharedState, SseHub,
        item::{Answer, Feature, ItemId},
    },
};

const TICK: Duration = Duration::from_secs(1);

/// Reply channel of a command: the updated view, or why the command was refused.
pub type CommandReply = oneshot::Sender<Result<SessionView, ServiceError>>;

/// Participant actions forwarded from the render bridge to the session loop.
#[derive(Debug)]
pub enum SessionCommand {
    /// Record an answer for an item and submit it.
    Answer {
        /// Item being answered.
        item_id: ItemId,
        /// Raw option key; `None` clears the choice.
        option: Option<String>,
        /// Submit as skipped.
        skipped: bool,
        /// Flag for review.
        marked_for_review: bool,
        /// Where the outcome goes.
        reply: CommandReply,
    },
    /// Change the local selection of the current item.
    Select {
        /// Raw option key; `None` clears the selection.
        option: Option<String>,
        /// Where the outcome goes.
        reply: CommandReply,
    },
    /// Submit the current selection, or a skip.
    SubmitCurrent {
        /// Where the outcome goes.
        reply: CommandReply,
    },
    /// Apply a section boundary choice.
    Boundary {
        /// Review, advance or finish.
        choice: BoundaryChoice,
        /// Where the outcome goes.
        reply: CommandReply,
    },
    /// Navigate to an item.
    Jump {
        /// Target item.
        item_id: ItemId,
        /// Where the outcome goes.
        reply: CommandReply,
    },
    /// Stop the runner and release the channel.
    Leave {
        /// Signalled once teardown is done.
        reply: oneshot::Sender<()>,
    },
}

/// Result of remote work, delivered back to the loop.
enum Completion {
    Restore(AuthorityResult<Option<Value>>),
    Submitted {
        item_id: ItemId,
        result: AuthorityResult<()>,
    },
    Section {
        request: SectionRequest,
        purpose: SectionPurpose,
        plan: Option<PlanId>,
        result: AuthorityResult<Option<Value>>,
    },
    Finalized(AuthorityResult<()>),
    /// A detached call panicked; its result is lost.
    Lost(JoinError),
    ParticipantCount(AuthorityResult<u32>),
    Leaderboard(AuthorityResult<Value>),
}

struct Tagged {
    generation: Generation,
    completion: Completion,
}

/// Channels wiring a runner to the rest of the application.
pub struct RunnerChannels {
    /// Frames from the channel registry.
    pub deliveries: mpsc::Receiver<Delivery>,
    /// Commands from the render bridge.
    pub commands: mpsc::Receiver<SessionCommand>,
    /// Latest view, read by the render bridge.
    pub view: watch::Sender<SessionView>,
}

/// Owner of one [`ExamSession`]; see the module docs.
pub struct SessionRunner {
    state: SharedState,
    config: Arc<AppConfig>,
    authority: Arc<dyn Authority>,
    session: ExamSession,
    topic: String,
    hub: Arc<SseHub>,
    filter: FrameFilter,
    deliveries: mpsc::Receiver<Delivery>,
    commands: mpsc::Receiver<SessionCommand>,
    view: watch::Sender<SessionView>,
    tasks: JoinSet<Tagged>,
    restore_pending: bool,
}

impl SessionRunner {
    /// Runner for `session`; nothing happens until [`SessionRunner::run`] is awaited.
    pub fn new(state: SharedState, session: ExamSession, channels: RunnerChannels) -> Self {
        let config = Arc::clone(state.config());
        let authority = state.authority();
        let topic = session.store.session_id().to_string();
        let hub = state.session_sse(session.store.session_id());
        let filter = FrameFilter::new(config.channel.dedup_window);

        Self {
            state,
            config,
            authority,
            session,
            topic,
            hub,
            filter,
            deliveries: channels.deliveries,
            commands: channels.commands,
            view: channels.view,
            tasks: JoinSet::new(),
            restore_pending: false,
        }
    }

    /// Drive the session until it is left or every handle to it is dropped.
    pub async fn run(mut self) {
        let generation = self.session.generation;
        info!(
            session_id = %self.session.store.session_id(),
            %generation,
            feature = ?self.session.feature(),
            "session runner started"
        );

        self.start_restore();

        let mut ticker = time::interval_at(Instant::now() + TICK, TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut clock_cycle = self.session.clock.cycle();

        let grace = time::sleep(self.config.channel.late_join_grace);
        tokio::pin!(grace);
        let mut grace_pending = true;

        let poll_interval = self.config.poll.participant_interval;
        let polling = !poll_interval.is_zero();
        let poll = time::sleep(participant_poller::jittered(poll_interval));
        tokio::pin!(poll);

        self.publish();

        loop {
            let changed = tokio::select! {
                _ = ticker.tick() => self.on_tick(),
                Some(delivery) = self.deliveries.recv() => self.on_delivery(delivery),
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Leave { reply }) => {
                        self.teardown("left");
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.teardown("released");
                        return;
                    }
                },
                Some(joined) = self.tasks.join_next() => self.on_joined(joined),
                _ = &mut grace, if grace_pending => {
                    grace_pending = false;
                    self.on_grace_elapsed()
                }
                _ = &mut poll, if polling => {
                    poll.as_mut().reset(Instant::now() + participant_poller::jittered(poll_interval));
                    self.on_poll()
                }
            };

            if self.session.clock.cycle() != clock_cycle {
                clock_cycle = self.session.clock.cycle();
                ticker.reset();
            }
            if changed {
                self.publish();
            }
        }
    }

    fn publish(&self) {
        let view = SessionView::from_session(&self.session);
        sse_events::broadcast_session_view(&self.hub, &view);
        self.view.send_replace(view);
    }

    fn start_restore(&mut self) {
        self.restore_pending = true;
        let request = self
            .authority
            .fetch_current_state(self.session.store.session_id().clone());
        self.spawn(async move { Completion::Restore(bounded(request).await) });
    }

    fn spawn<F>(&mut self, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let generation = self.session.generation;
        self.tasks.spawn(async move {
            Tagged {
                generation,
                completion: work.await,
            }
        });
    }

    /// Spawn work that must outlive the runner (answers and finalize); only its result is tied to the loop.
    fn spawn_detached<F>(&mut self, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        self.spawn(async move {
            handle.await.unwrap_or_else(Completion::Lost)
        });
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Submit(submission) => {
                    let item_id = submission.item_id.clone();
                    let request = self.authority.submit_answer(submission);
                    self.spawn_detached(async move {
                        Completion::Submitted {
                            item_id,
                            result: bounded(request).await,
                        }
                    });
                }
                Effect::LoadSection {
                    request,
                    purpose,
                    plan,
                } => {
                    let call = self
                        .authority
                        .load_section(self.session.store.session_id().clone(), request.clone());
                    self.spawn(async move {
                        Completion::Section {
                            request,
                            purpose,
                            plan,
                            result: bounded(call).await,
                        }
                    });
                }
                Effect::Finalize => {
                    let authority = Arc::clone(&self.authority);
                    let session_id = self.session.store.session_id().clone();
                    let participant_id = self.session.store.participant_id().clone();
                    let attempts = self.config.finalize.max_attempts;
                    self.spawn_detached(async move {
                        Completion::Finalized(
                            section_navigator::finalize_with_retries(
                                authority,
                                session_id,
                                participant_id,
                                attempts,
                            )
                            .await,
                        )
                    });
                }
            }
        }
    }

    fn apply(&mut self, outcome: Outcome) -> bool {
        let applied = outcome.applied;
        self.run_effects(outcome.effects);
        applied
    }

    fn on_tick(&mut self) -> bool {
        let running = self.session.clock.is_running();
        match self.session.clock.tick() {
            Some(_) => {
                debug!(session_id = %self.session.store.session_id(), "clock expired");
                let outcome = phase_controller::on_expired(&mut self.session, &self.config);
                self.apply(outcome);
                true
            }
            None => running,
        }
    }

    fn on_delivery(&mut self, delivery: Delivery) -> bool {
        if delivery.generation != self.session.generation {
            debug!(
                session_id = %self.session.store.session_id(),
                stale = %delivery.generation,
                current = %self.session.generation,
                "dropping frame for a previous session entry"
            );
            return false;
        }

        let event = ChannelEvent::from_json_str(&delivery.frame);
        if !self.filter.admit(&delivery.frame, &event) {
            debug!(
                session_id = %self.session.store.session_id(),
                kind = event.kind().as_str(),
                "dropping duplicate frame"
            );
            return false;
        }
        let first_live = !self.session.live_seen && event.kind() != EventKind::Unrecognized;
        if first_live {
            self.session.live_seen = true;
        }

        let outcome = phase_controller::apply_event(&mut self.session, &self.config, event);
        self.apply(outcome) || first_live
    }

    fn on_command(&mut self, command: SessionCommand) -> bool {
        let (result, reply) = match command {
            SessionCommand::Answer {
                item_id,
                option,
                skipped,
                marked_for_review,
                reply,
            } => (
                self.answer(item_id, option, skipped, marked_for_review),
                reply,
            ),
            SessionCommand::Select { option, reply } => (
                answer_submitter::select(&mut self.session, option.as_deref())
                    .map(|()| Outcome::applied()),
                reply,
            ),
            SessionCommand::SubmitCurrent { reply } => (
                answer_submitter::submit_current(&mut self.session, &self.config),
                reply,
            ),
            SessionCommand::Boundary { choice, reply } => {
                let result = match choice {
                    BoundaryChoice::Review => section_navigator::review(&mut self.session),
                    BoundaryChoice::Advance => section_navigator::request_advance(&mut self.session),
                    BoundaryChoice::Finish => section_navigator::finish(&mut self.session),
                };
                (result, reply)
            }
            SessionCommand::Jump { item_id, reply } => (
                section_navigator::jump(&mut self.session, &self.config, item_id),
                reply,
            ),
            SessionCommand::Leave { reply } => {
                let _ = reply.send(());
                return false;
            }
        };

        match result {
            Ok(outcome) => {
                let changed = self.apply(outcome);
                let _ = reply.send(Ok(SessionView::from_session(&self.session)));
                changed
            }
            Err(err) => {
                debug!(
                    session_id = %self.session.store.session_id(),
                    error = %err,
                    "command refused"
                );
                let _ = reply.send(Err(err));
                false
            }
        }
    }

    fn answer(
        &mut self,
        item_id: ItemId,
        option: Option<String>,
        skipped: bool,
        marked_for_review: bool,
    ) -> Result<Outcome, ServiceError> {
        let choice = option
            .as_deref()
            .map(|raw| answer_submitter::resolve_option(&self.session, &item_id, raw))
            .transpose()?;
        let answer = Answer {
            choice,
            skipped,
            marked_for_review,
        };
        let submission =
            answer_submitter::record(&mut self.session, &self.config, &item_id, answer, false)?;
        Ok(Outcome::applied().with_effects(submission.map(Effect::Submit)))
    }

    fn on_joined(&mut self, joined: Result<Tagged, JoinError>) -> bool {
        let tagged = match joined {
            Ok(tagged) => tagged,
            Err(err) if err.is_cancelled() => return false,
            Err(err) => {
                warn!(
                    session_id = %self.session.store.session_id(),
                    error = %err,
                    "authority task failed"
                );
                return false;
            }
        };
        if tagged.generation != self.session.generation {
            debug!(
                session_id = %self.session.store.session_id(),
                stale = %tagged.generation,
                "discarding result of a previous session entry"
            );
            return false;
        }

        match tagged.completion {
            Completion::Restore(result) => {
                self.restore_pending = false;
                let outcome = restore_loader::apply_restore(&mut self.session, &self.config, result);
                self.apply(outcome)
            }
            Completion::Submitted { item_id, result } => {
                match result {
                    Ok(()) => debug!(
                        session_id = %self.session.store.session_id(),
                        item_id = %item_id,
                        "answer accepted"
                    ),
                    Err(err) => warn!(
                        session_id = %self.session.store.session_id(),
                        item_id = %item_id,
                        error = %err,
                        "answer submission failed; keeping the local answer"
                    ),
                }
                false
            }
            Completion::Section {
                request,
                purpose,
                plan,
                result,
            } => {
                let outcome = section_navigator::on_section_loaded(
                    &mut self.session,
                    &self.config,
                    &request,
                    purpose,
                    plan,
                    result,
                );
                self.apply(outcome);
                true
            }
            Completion::Finalized(result) => {
                self.session.store.finalized = result.is_ok();
                result.is_ok()
            }
            Completion::Lost(err) => {
                warn!(
                    session_id = %self.session.store.session_id(),
                    error = %err,
                    "detached authority call failed"
                );
                false
            }
            Completion::ParticipantCount(result) => match result {
                Ok(count) => phase_controller::apply_participant_count(&mut self.session, count),
                Err(err) => {
                    warn!(
                        session_id = %self.session.store.session_id(),
                        error = %err,
                        "participant count refresh failed"
                    );
                    false
                }
            },
            Completion::Leaderboard(result) => match result {
                Ok(body) => phase_controller::apply_polled_leaderboard(&mut self.session, &body),
                Err(err) => {
                    warn!(
                        session_id = %self.session.store.session_id(),
                        error = %err,
                        "leaderboard refresh failed"
                    );
                    false
                }
            },
        }
    }

    fn on_grace_elapsed(&mut self) -> bool {
        self.session.store.grace_elapsed = true;
        if !self.session.live_seen {
            info!(
                session_id = %self.session.store.session_id(),
                "no live event within the grace window; relying on restored state"
            );
        }
        true
    }

    fn on_poll(&mut self) -> bool {
        // A mock attempt whose first section never arrived retries it here.
        if !self.restore_pending && self.session.feature() == Feature::MockTest {
            let outcome = restore_loader::initial_section_load(&mut self.session, None);
            self.apply(outcome);
        }

        let plan = participant_poller::plan(&self.session);
        if plan.is_empty() {
            return false;
        }
        let session_id = self.session.store.session_id().clone();
        if plan.participant_count {
            let request = self.authority.participant_count(session_id.clone());
            self.spawn(async move { Completion::ParticipantCount(bounded(request).await) });
        }
        if plan.leaderboard {
            let request = self.authority.leaderboard(session_id);
            self.spawn(async move { Completion::Leaderboard(bounded(request).await) });
        }
        false
    }

    fn teardown(&mut self, reason: &str) {
        let session_id = self.session.store.session_id().clone();
        let generation = self.session.generation;

        self.session.clock.disarm();
        self.state.channels().unsubscribe(&self.topic, generation);
        self.tasks.abort_all();
        self.deliveries.close();

        let removed = self
            .state
            .sessions()
            .remove_if(&session_id, |_, handle| handle.generation == generation)
            .is_some();
        sse_events::broadcast_session_closed(&self.hub, &session_id, reason);
        if removed {
            self.state.forget_session_sse(&session_id);
        }

        info!(session_id = %session_id, %generation, reason, "session runner stopped");
    }
}

/// Bound a remote call by [`DEFAULT_TRANSITION_TIMEOUT`].
async fn bounded<T>(call: impl Future<Output = AuthorityResult<T>>) -> AuthorityResult<T> {
    match time::timeout(DEFAULT_TRANSITION_TIMEOUT, call).await {
        Ok(result) => result,
        Err(elapsed) => Err(AuthorityError::unavailable(
            "authority call timed out".to_string(),
            elapsed,
        )),
    }
}
