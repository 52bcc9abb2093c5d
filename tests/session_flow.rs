use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::time::{sleep, timeout};

use live_exam_sync::{
    config::AppConfig,
    dao::{
        authority::{Authority, AuthorityResult},
        channel::LocalBroadcast,
    },
    dto::{
        phase::VisiblePhase,
        section::SectionRequest,
        session::{BoundaryChoice, SessionView},
        submission::AnswerSubmission,
    },
    error::ServiceError,
    services::session_service,
    state::{
        AppState, SharedState,
        item::{Feature, ItemId, OptionKey, ParticipantId, SessionId},
    },
};

#[derive(Default)]
struct RecordingAuthority {
    restore: Mutex<Option<Value>>,
    restore_delay: Duration,
    sections: Mutex<VecDeque<Value>>,
    submissions: Mutex<Vec<AnswerSubmission>>,
    completions: AtomicU32,
}

impl RecordingAuthority {
    fn submissions(&self) -> Vec<AnswerSubmission> {
        self.submissions.lock().expect("lock").clone()
    }
}

impl Authority for RecordingAuthority {
    fn fetch_current_state(&self, _: SessionId) -> BoxFuture<'static, AuthorityResult<Option<Value>>> {
        let record = self.restore.lock().expect("lock").clone();
        let delay = self.restore_delay;
        Box::pin(async move {
            sleep(delay).await;
            Ok(record)
        })
    }

    fn submit_answer(&self, submission: AnswerSubmission) -> BoxFuture<'static, AuthorityResult<()>> {
        self.submissions.lock().expect("lock").push(submission);
        Box::pin(async { Ok(()) })
    }

    fn load_section(
        &self,
        _: SessionId,
        _: SectionRequest,
    ) -> BoxFuture<'static, AuthorityResult<Option<Value>>> {
        let next = self.sections.lock().expect("lock").pop_front();
        Box::pin(async move { Ok(next) })
    }

    fn mark_complete(&self, _: SessionId, _: ParticipantId) -> BoxFuture<'static, AuthorityResult<()>> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn participant_count(&self, _: SessionId) -> BoxFuture<'static, AuthorityResult<u32>> {
        Box::pin(async { Ok(12) })
    }

    fn leaderboard(&self, _: SessionId) -> BoxFuture<'static, AuthorityResult<Value>> {
        Box::pin(async { Ok(json!([])) })
    }
}

struct Harness {
    state: SharedState,
    authority: Arc<RecordingAuthority>,
    channel: LocalBroadcast,
}

impl Harness {
    fn new(authority: RecordingAuthority) -> Self {
        let authority = Arc::new(authority);
        let channel = LocalBroadcast::new(32);
        let state = AppState::new(
            AppConfig::default(),
            authority.clone(),
            Arc::new(channel.clone()),
        );
        Self {
            state,
            authority,
            channel,
        }
    }

    async fn enter(&self, session: &str, feature: Feature) -> SessionView {
        let view = session_service::enter_session(
            &self.state,
            SessionId::from(session),
            ParticipantId::from("p1"),
            feature,
        )
        .await
        .expect("enter session");
        let channel = self.channel.clone();
        let topic = session.to_string();
        eventually(move || channel.subscriber_count(&topic) == 1).await;
        view
    }

    async fn view_until(&self, session: &str, mut ready: impl FnMut(&SessionView) -> bool) -> SessionView {
        let id = SessionId::from(session);
        timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(view) = session_service::current_view(&self.state, &id)
                    && ready(&view)
                {
                    return view;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("view reached the expected state")
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(3), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

const NEW_QUESTION: &str = r#"{"type":"new_question","data":{"mcq_id":"Q1","react_order":1,
    "total_mcqs":5,"time":15,"question":"Pick one","options":["red","blue","green","gold"]}}"#;

fn section(prefix: &str, number: u32, total: u32) -> Value {
    json!({
        "section_id": format!("sec-{number}"),
        "section_number": number,
        "total_sections": total,
        "items": [
            {"id": format!("{prefix}1"), "question": "first", "options": ["x", "y"]},
            {"id": format!("{prefix}2"), "question": "second", "options": ["x", "y"]},
        ],
    })
}

#[tokio::test]
async fn battle_question_answered_once_per_distinct_answer() {
    let harness = Harness::new(RecordingAuthority::default());
    let view = harness.enter("b1", Feature::Battle).await;
    assert_eq!(view.phase, VisiblePhase::Awaiting);

    harness.channel.publish("b1", NEW_QUESTION);
    let view = harness
        .view_until("b1", |view| view.phase == VisiblePhase::Question)
        .await;
    let item = view.item.expect("current item");
    assert_eq!(item.id, ItemId::from("Q1"));
    assert_eq!(item.options.len(), 4);
    assert!(item.correct_option.is_none());
    assert_eq!(view.item_index, 1);

    let id = SessionId::from("b1");
    let answered = session_service::answer(&harness.state, &id, ItemId::from("Q1"), Some("b".into()), false, false)
        .await
        .expect("answer accepted");
    assert_eq!(
        answered.item.and_then(|item| item.answer.choice),
        Some(OptionKey("B".into()))
    );
    let authority = harness.authority.clone();
    eventually(move || authority.submissions().len() == 1).await;

    session_service::answer(&harness.state, &id, ItemId::from("Q1"), Some("B".into()), false, false)
        .await
        .expect("repeat accepted");
    sleep(Duration::from_millis(50)).await;

    let submissions = harness.authority.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].item_id, ItemId::from("Q1"));
    assert_eq!(submissions[0].selected_option, Some(OptionKey("B".into())));
}

#[tokio::test]
async fn unknown_option_is_rejected_without_submission() {
    let harness = Harness::new(RecordingAuthority::default());
    harness.enter("b2", Feature::Battle).await;
    harness.channel.publish("b2", NEW_QUESTION);
    harness
        .view_until("b2", |view| view.phase == VisiblePhase::Question)
        .await;

    let result = session_service::answer(
        &harness.state,
        &SessionId::from("b2"),
        ItemId::from("Q1"),
        Some("z".into()),
        false,
        false,
    )
    .await;
    match result {
        Err(ServiceError::InvalidInput(_)) => {}
        other => panic!("unexpected answer result: {other:?}"),
    }
    assert!(harness.authority.submissions().is_empty());
}

#[tokio::test]
async fn leaderboard_rows_keep_authority_order() {
    let harness = Harness::new(RecordingAuthority::default());
    harness.enter("b3", Feature::Battle).await;

    harness.channel.publish(
        "b3",
        r#"{"type":"update_leaderboard","data":[
            {"user_id":"u2","name":"Bo","score":9,"rank":1},
            {"user_id":"u1","name":"Al","score":4,"rank":2}]}"#,
    );
    let view = harness
        .view_until("b3", |view| view.phase == VisiblePhase::Leaderboard)
        .await;

    let order = view
        .leaderboard
        .iter()
        .map(|row| (row.participant_id.0.as_str(), row.rank))
        .collect::<Vec<_>>();
    assert_eq!(order, vec![("u2", 1), ("u1", 2)]);
}

#[tokio::test]
async fn frames_after_leave_do_not_reach_the_next_entry() {
    let harness = Harness::new(RecordingAuthority::default());
    harness.enter("b4", Feature::Battle).await;

    session_service::leave_session(&harness.state, &SessionId::from("b4"))
        .await
        .expect("leave");
    let channel = harness.channel.clone();
    eventually(move || channel.subscriber_count("b4") == 0).await;
    match session_service::current_view(&harness.state, &SessionId::from("b4")) {
        Err(ServiceError::NotFound(_)) => {}
        other => panic!("unexpected view after leave: {other:?}"),
    }

    assert_eq!(harness.channel.publish("b4", NEW_QUESTION), 0);

    let view = harness.enter("b4", Feature::Battle).await;
    assert_eq!(view.phase, VisiblePhase::Awaiting);
    sleep(Duration::from_millis(50)).await;
    let view = session_service::current_view(&harness.state, &SessionId::from("b4")).expect("view");
    assert_eq!(view.phase, VisiblePhase::Awaiting);
    assert!(view.item.is_none());
}

#[tokio::test]
async fn live_event_wins_over_a_slow_restore() {
    let authority = RecordingAuthority {
        restore: Mutex::new(Some(json!({
            "phase": "stats",
            "current_question_index": 3,
            "total_mcqs": 10,
            "current_question": {"mcq_id": "Q4", "options": {"a": "red", "b": "blue"}},
        }))),
        restore_delay: Duration::from_millis(300),
        ..RecordingAuthority::default()
    };
    let harness = Harness::new(authority);
    harness.enter("b5", Feature::Battle).await;

    harness.channel.publish("b5", NEW_QUESTION);
    harness
        .view_until("b5", |view| view.phase == VisiblePhase::Question)
        .await;
    sleep(Duration::from_millis(400)).await;

    let view = session_service::current_view(&harness.state, &SessionId::from("b5")).expect("view");
    assert_eq!(view.phase, VisiblePhase::Question);
    assert_eq!(view.item.map(|item| item.id), Some(ItemId::from("Q1")));
    assert!(!view.awaiting_live);
}

#[tokio::test]
async fn mock_test_walks_sections_and_finalizes_once() {
    let authority = RecordingAuthority {
        sections: Mutex::new(VecDeque::from([section("a", 1, 2), section("b", 2, 2)])),
        ..RecordingAuthority::default()
    };
    let harness = Harness::new(authority);
    harness.enter("m1", Feature::MockTest).await;
    let id = SessionId::from("m1");

    let view = harness
        .view_until("m1", |view| view.phase == VisiblePhase::InProgress)
        .await;
    assert_eq!(view.item.map(|item| item.id), Some(ItemId::from("a1")));
    assert_eq!(view.items.len(), 2);
    assert!(view.remaining_secs >= 1795, "{}", view.remaining_secs);

    session_service::select(&harness.state, &id, Some("a".into()))
        .await
        .expect("select");
    let view = session_service::submit_current(&harness.state, &id)
        .await
        .expect("submit first");
    assert_eq!(view.item.map(|item| item.id), Some(ItemId::from("a2")));

    let view = session_service::submit_current(&harness.state, &id)
        .await
        .expect("skip second");
    assert_eq!(view.phase, VisiblePhase::SectionBoundary);

    session_service::boundary(&harness.state, &id, BoundaryChoice::Advance)
        .await
        .expect("advance");
    let view = harness
        .view_until("m1", |view| view.phase == VisiblePhase::InProgress)
        .await;
    assert_eq!(view.item.map(|item| item.id), Some(ItemId::from("b1")));
    assert_eq!(view.section.map(|section| section.is_last), Some(true));

    let view = session_service::boundary(&harness.state, &id, BoundaryChoice::Finish)
        .await
        .expect("finish");
    assert_eq!(view.phase, VisiblePhase::Completed);
    let authority = harness.authority.clone();
    eventually(move || authority.completions.load(Ordering::SeqCst) == 1).await;

    let submissions = harness.authority.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].selected_option, Some(OptionKey("A".into())));
    assert!(submissions[1].skipped);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.authority.completions.load(Ordering::SeqCst), 1);
}
