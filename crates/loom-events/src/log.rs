use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use loom_protocol::{ConversationError, ConversationResult, Event, EventId};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::store::{InMemoryRecordStore, RecordStore};

const RECORD_PREFIX: &str = "event-";
const RECORD_SUFFIX: &str = ".json";
/// Decoded events kept in memory per log.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

pub fn record_name(index: usize, event_id: &EventId) -> String {
    format!("{RECORD_PREFIX}{index:05}-{event_id}{RECORD_SUFFIX}")
}

/// Split a record name back into `(index, event_id)`.
pub fn parse_record_name(name: &str) -> Option<(usize, EventId)> {
    let stem = name.strip_prefix(RECORD_PREFIX)?.strip_suffix(RECORD_SUFFIX)?;
    let (index, event_id) = stem.split_once('-')?;
    if event_id.is_empty() {
        return None;
    }
    Some((index.parse().ok()?, EventId::from_string(event_id)))
}

#[derive(Debug, Clone)]
struct LogEntry {
    event_id: EventId,
    record: String,
}

/// Bounded read cache; the oldest insertion is evicted first.
#[derive(Debug)]
struct EventCache {
    capacity: usize,
    events: HashMap<usize, Event>,
    order: VecDeque<usize>,
}

impl EventCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, index: usize) -> Option<Event> {
        self.events.get(&index).cloned()
    }

    fn insert(&mut self, index: usize, event: Event) {
        if self.capacity == 0 {
            return;
        }
        if self.events.insert(index, event).is_none() {
            self.order.push_back(index);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.events.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.events.len()
    }
}

/// Append-only, ID-indexed sequence of conversation events.
///
/// Index maps are rebuilt from the store when the log is opened and kept up to
/// date by [`EventLog::append`]. Event bodies are read lazily; only the most
/// recent ones stay cached. Callers serialize writers through the conversation
/// state lock.
pub struct EventLog {
    store: Arc<dyn RecordStore>,
    entries: Vec<LogEntry>,
    index_by_id: HashMap<EventId, usize>,
    /// Index the next record is written under; past every persisted record.
    next_record: usize,
    cache: Mutex<EventCache>,
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl EventLog {
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryRecordStore::new()),
            entries: Vec::new(),
            index_by_id: HashMap::new(),
            next_record: 0,
            cache: Mutex::new(EventCache::new(DEFAULT_CACHE_CAPACITY)),
        }
    }

    pub fn with_cache_capacity(self, capacity: usize) -> Self {
        Self {
            cache: Mutex::new(EventCache::new(capacity)),
            ..self
        }
    }

    /// Scan the store and build the index maps. Gaps in the persisted index
    /// sequence and duplicate event ids are logged; for a duplicate id the
    /// first-seen record wins.
    #[instrument(skip(store))]
    pub fn open(store: Arc<dyn RecordStore>) -> ConversationResult<Self> {
        let mut records: Vec<(usize, EventId, String)> = store
            .list()?
            .into_iter()
            .filter_map(|name| {
                parse_record_name(&name).map(|(index, event_id)| (index, event_id, name))
            })
            .collect();
        records.sort_by(|left, right| left.0.cmp(&right.0).then_with(|| left.2.cmp(&right.2)));

        let mut entries = Vec::with_capacity(records.len());
        let mut index_by_id = HashMap::with_capacity(records.len());
        let mut expected = 0_usize;
        let next_record = records.last().map_or(0, |record| record.0.saturating_add(1));
        for (index, event_id, record) in records {
            if index != expected {
                warn!(expected, found = index, record = %record, "gap in event log indices");
            }
            expected = index.saturating_add(1);

            if let Some(first) = index_by_id.get(&event_id) {
                warn!(
                    event_id = %event_id,
                    kept_index = *first,
                    duplicate_index = index,
                    "duplicate event id in event log; keeping first occurrence"
                );
                continue;
            }
            index_by_id.insert(event_id.clone(), entries.len());
            entries.push(LogEntry { event_id, record });
        }

        debug!(count = entries.len(), next_record, "event log opened");
        Ok(Self {
            store,
            entries,
            index_by_id,
            next_record,
            cache: Mutex::new(EventCache::new(DEFAULT_CACHE_CAPACITY)),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, event_id: &EventId) -> bool {
        self.index_by_id.contains_key(event_id)
    }

    /// Append `event` at the next index. A duplicate id is rejected and the
    /// log is left untouched.
    #[instrument(skip(self, event), fields(event_id = %event.id, kind = event.kind.name()))]
    pub fn append(&mut self, event: &Event) -> ConversationResult<usize> {
        if self.index_by_id.contains_key(&event.id) {
            warn!("rejected event with duplicate id");
            return Err(ConversationError::DuplicateEventId(event.id.to_string()));
        }

        let index = self.entries.len();
        let record = record_name(self.next_record, &event.id);
        let contents = serde_json::to_string_pretty(event)?;
        self.store.write(&record, &contents)?;
        self.next_record += 1;

        self.index_by_id.insert(event.id.clone(), index);
        self.entries.push(LogEntry {
            event_id: event.id.clone(),
            record,
        });
        self.cache.lock().insert(index, event.clone());
        debug!(index, "event appended to log");
        Ok(index)
    }

    fn resolve(&self, index: isize) -> ConversationResult<usize> {
        let len = self.entries.len();
        let resolved = if index < 0 {
            len.checked_sub(index.unsigned_abs())
        } else {
            Some(index.unsigned_abs())
        };
        resolved
            .filter(|resolved| *resolved < len)
            .ok_or(ConversationError::IndexOutOfRange { index, len })
    }

    fn load(&self, index: usize) -> ConversationResult<Event> {
        if let Some(event) = self.cache.lock().get(index) {
            return Ok(event);
        }
        let entry = &self.entries[index];
        let raw = self.store.read(&entry.record)?;
        let event: Event = serde_json::from_str(&raw).map_err(|error| {
            ConversationError::MalformedRecord(format!("{}: {error}", entry.record))
        })?;
        self.cache.lock().insert(index, event.clone());
        Ok(event)
    }

    /// Event at `index`; negative values count from the end.
    pub fn get(&self, index: isize) -> ConversationResult<Event> {
        let resolved = self.resolve(index)?;
        self.load(resolved)
    }

    pub fn get_id(&self, index: isize) -> ConversationResult<EventId> {
        let resolved = self.resolve(index)?;
        Ok(self.entries[resolved].event_id.clone())
    }

    pub fn get_index(&self, event_id: &EventId) -> ConversationResult<usize> {
        self.index_by_id
            .get(event_id)
            .copied()
            .ok_or_else(|| ConversationError::EventNotFound(event_id.to_string()))
    }

    pub fn get_by_id(&self, event_id: &EventId) -> ConversationResult<Event> {
        let index = self.get_index(event_id)?;
        self.load(index)
    }

    pub fn last(&self) -> ConversationResult<Option<Event>> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        self.load(self.entries.len() - 1).map(Some)
    }

    /// Slice with list-style bounds: `None` means open, negatives count from
    /// the end, and out-of-range bounds are clamped.
    pub fn slice(&self, start: Option<isize>, end: Option<isize>) -> ConversationResult<Vec<Event>> {
        let len = self.entries.len();
        let clamp = |bound: isize| -> usize {
            if bound < 0 {
                len.saturating_sub(bound.unsigned_abs())
            } else {
                bound.unsigned_abs().min(len)
            }
        };
        let start = start.map_or(0, clamp);
        let end = end.map_or(len, clamp);
        (start..end.max(start)).map(|index| self.load(index)).collect()
    }

    pub fn event_ids(&self) -> impl Iterator<Item = &EventId> {
        self.entries.iter().map(|entry| &entry.event_id)
    }

    /// Lazy iteration from the first event; each call starts over.
    pub fn iter(&self) -> EventLogIter<'_> {
        self.iter_from(0)
    }

    pub fn iter_from(&self, start: usize) -> EventLogIter<'_> {
        EventLogIter {
            log: self,
            position: start,
        }
    }

    pub fn to_vec(&self) -> ConversationResult<Vec<Event>> {
        self.iter().collect()
    }

    pub(crate) fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

pub struct EventLogIter<'a> {
    log: &'a EventLog,
    position: usize,
}

impl Iterator for EventLogIter<'_> {
    type Item = ConversationResult<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.log.len() {
            return None;
        }
        let item = self.log.load(self.position);
        self.position += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.log.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

impl<'a> IntoIterator for &'a EventLog {
    type Item = ConversationResult<Event>;
    type IntoIter = EventLogIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
