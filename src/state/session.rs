use indexmap::IndexMap;

use crate::state::item::{
    AggregateCounts, Feature, Item, ItemId, LeaderboardEntry, OptionKey, ParticipantId, SessionId,
};

/// Metadata about the mock-test section currently loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionInfo {
    /// Authority identifier of the section.
    pub id: String,
    /// One-based section number, when supplied.
    pub number: Option<u32>,
    /// Total number of sections in the attempt, when supplied.
    pub total_sections: Option<u32>,
}

impl SectionInfo {
    /// Whether the authority told us this is the final section.
    pub fn is_last(&self) -> bool {
        matches!((self.number, self.total_sections), (Some(n), Some(total)) if n >= total)
    }
}

/// In-memory representation of everything the renderer shows for one session.
///
/// Only the phase controller, the restore loader (before the first live event)
/// and the answer submitter's optimistic write mutate this store.
#[derive(Debug, Clone)]
pub struct SessionStore {
    pub(crate) session_id: SessionId,
    pub(crate) participant_id: ParticipantId,
    pub(crate) feature: Feature,
    /// Battle: at most the current item. Mock test: the loaded section batch in order.
    pub(crate) items: IndexMap<ItemId, Item>,
    pub(crate) current: Option<ItemId>,
    /// One-based position of the current item (battle: in the session, mock: in the section).
    pub(crate) item_index: u32,
    pub(crate) total_items: u32,
    pub(crate) selected: Option<OptionKey>,
    pub(crate) aggregates: Option<AggregateCounts>,
    pub(crate) leaderboard: Vec<LeaderboardEntry>,
    pub(crate) participant_count: Option<u32>,
    pub(crate) answers_locked: bool,
    pub(crate) section: Option<SectionInfo>,
    /// A finalize call chain has been started; it is never started twice.
    pub(crate) finalize_requested: bool,
    pub(crate) finalized: bool,
    pub(crate) grace_elapsed: bool,
}

impl SessionStore {
    /// Empty store for a freshly entered session.
    pub fn new(session_id: SessionId, participant_id: ParticipantId, feature: Feature) -> Self {
        Self {
            session_id,
            participant_id,
            feature,
            items: IndexMap::new(),
            current: None,
            item_index: 0,
            total_items: 0,
            selected: None,
            aggregates: None,
            leaderboard: Vec::new(),
            participant_count: None,
            answers_locked: false,
            section: None,
            finalize_requested: false,
            finalized: false,
            grace_elapsed: false,
        }
    }

    /// Session this store belongs to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Participant taking part.
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Battle or mock test.
    pub fn feature(&self) -> Feature {
        self.feature
    }

    /// Item currently shown.
    pub fn current_item(&self) -> Option<&Item> {
        self.current.as_ref().and_then(|id| self.items.get(id))
    }

    /// Loaded item by id.
    pub fn item(&self, id: &ItemId) -> Option<&Item> {
        self.items.get(id)
    }

    /// One-based position of the current item.
    pub fn item_index(&self) -> u32 {
        self.item_index
    }

    /// Items in the session (battle) or section (mock test).
    pub fn total_items(&self) -> u32 {
        self.total_items
    }

    /// Local selection of the current item.
    pub fn selected(&self) -> Option<&OptionKey> {
        self.selected.as_ref()
    }

    /// Revealed answer counts.
    pub fn aggregates(&self) -> Option<&AggregateCounts> {
        self.aggregates.as_ref()
    }

    /// Rows in authority order.
    pub fn leaderboard(&self) -> &[LeaderboardEntry] {
        &self.leaderboard
    }

    /// Last polled or pushed participant count.
    pub fn participant_count(&self) -> Option<u32> {
        self.participant_count
    }

    /// Answers for the current item are refused.
    pub fn answers_locked(&self) -> bool {
        self.answers_locked
    }

    /// Loaded section.
    pub fn section(&self) -> Option<&SectionInfo> {
        self.section.as_ref()
    }

    /// The completion call succeeded.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The late-join grace period ran out without a live event.
    pub fn grace_elapsed(&self) -> bool {
        self.grace_elapsed
    }

    /// Ordered items of the loaded batch.
    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub(crate) fn current_item_mut(&mut self) -> Option<&mut Item> {
        let id = self.current.as_ref()?;
        self.items.get_mut(id)
    }

    pub(crate) fn item_mut(&mut self, id: &ItemId) -> Option<&mut Item> {
        self.items.get_mut(id)
    }

    /// Make `item` the only (and current) battle item, clearing per-item state.
    pub(crate) fn replace_current_item(&mut self, item: Item) {
        let id = item.id.clone();
        self.items.clear();
        self.items.insert(id.clone(), item);
        self.current = Some(id);
        self.selected = None;
        self.aggregates = None;
        self.answers_locked = false;
    }

    /// Replace the loaded batch wholesale and point at `position` (zero-based).
    pub(crate) fn load_batch(&mut self, items: Vec<Item>, section: SectionInfo, position: usize) {
        self.items = items
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect();
        self.section = Some(section);
        self.total_items = u32::try_from(self.items.len()).unwrap_or(u32::MAX);
        self.answers_locked = false;
        self.move_to(position);
    }

    /// Zero-based position of `id` within the loaded batch.
    pub(crate) fn position_of(&self, id: &ItemId) -> Option<usize> {
        self.items.get_index_of(id)
    }

    /// Zero-based position of the current item.
    pub(crate) fn current_position(&self) -> Option<usize> {
        self.current.as_ref().and_then(|id| self.position_of(id))
    }

    /// Point at the batch item at `position` and re-sync the selection from its stored answer.
    pub(crate) fn move_to(&mut self, position: usize) {
        match self.items.get_index(position) {
            Some((id, item)) => {
                self.current = Some(id.clone());
                self.selected = item.answer.choice.clone();
                self.item_index = u32::try_from(position + 1).unwrap_or(u32::MAX);
            }
            None => {
                self.current = None;
                self.selected = None;
                self.item_index = 0;
            }
        }
    }

    /// Whether the current item is the last item of the loaded batch.
    pub(crate) fn at_last_item(&self) -> bool {
        match self.current_position() {
            Some(position) => position + 1 >= self.items.len(),
            None => false,
        }
    }
}
