//! Pending work for one unit of work.
//!
//! The tracker accumulates stream actions, archive/tombstone commands and
//! document operations until the owning session commits. Repeated calls that
//! target the same stream are coalesced into a single [`StreamAction`] so the
//! writer assigns one contiguous version range per stream.

use nonempty::NonEmpty;

use crate::{
    event::{PendingEvent, StreamId},
    store::StorageOperation,
};

/// Whether a stream action creates the stream or appends to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Start,
    Append,
}

/// Events queued against one stream.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamAction {
    pub stream_id: StreamId,
    pub kind: ActionKind,
    pub aggregate_type: Option<String>,
    /// Version the stream must be at before these events are appended.
    pub expected_version: Option<i64>,
    pub events: NonEmpty<PendingEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamCommand {
    Archive(StreamId),
    Tombstone(StreamId),
}

impl StreamCommand {
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        match self {
            Self::Archive(id) | Self::Tombstone(id) => id,
        }
    }
}

/// Accumulated, uncommitted work.
#[derive(Clone, Debug, Default)]
pub struct WorkTracker {
    actions: Vec<StreamAction>,
    commands: Vec<StreamCommand>,
    operations: Vec<StorageOperation>,
}

impl WorkTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stream start. Any earlier append to the same stream in this
    /// unit of work becomes part of the start.
    pub fn start(
        &mut self,
        stream_id: StreamId,
        aggregate_type: Option<String>,
        events: NonEmpty<PendingEvent>,
    ) {
        self.merge(stream_id, ActionKind::Start, aggregate_type, None, events);
    }

    /// Queue an append, optionally guarded by an expected version.
    pub fn append(
        &mut self,
        stream_id: StreamId,
        expected_version: Option<i64>,
        events: NonEmpty<PendingEvent>,
    ) {
        self.merge(stream_id, ActionKind::Append, None, expected_version, events);
    }

    fn merge(
        &mut self,
        stream_id: StreamId,
        kind: ActionKind,
        aggregate_type: Option<String>,
        expected_version: Option<i64>,
        events: NonEmpty<PendingEvent>,
    ) {
        if let Some(action) = self.actions.iter_mut().find(|a| a.stream_id == stream_id) {
            if kind == ActionKind::Start {
                action.kind = ActionKind::Start;
            }
            if action.aggregate_type.is_none() {
                action.aggregate_type = aggregate_type;
            }
            if action.expected_version.is_none() {
                action.expected_version = expected_version;
            }
            action.events.extend(events);
            return;
        }

        self.actions.push(StreamAction {
            stream_id,
            kind,
            aggregate_type,
            expected_version,
            events,
        });
    }

    pub fn archive(&mut self, stream_id: StreamId) {
        self.commands.push(StreamCommand::Archive(stream_id));
    }

    pub fn tombstone(&mut self, stream_id: StreamId) {
        self.commands.push(StreamCommand::Tombstone(stream_id));
    }

    pub fn queue(&mut self, operation: StorageOperation) {
        self.operations.push(operation);
    }

    #[must_use]
    pub fn actions(&self) -> &[StreamAction] {
        &self.actions
    }

    #[must_use]
    pub fn commands(&self) -> &[StreamCommand] {
        &self.commands
    }

    #[must_use]
    pub fn operations(&self) -> &[StorageOperation] {
        &self.operations
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.commands.is_empty() && self.operations.is_empty()
    }

    /// Total number of queued events across all streams.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.actions.iter().map(|a| a.events.len()).sum()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (Vec<StreamAction>, Vec<StreamCommand>, Vec<StorageOperation>) {
        (self.actions, self.commands, self.operations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(n: i64) -> PendingEvent {
        PendingEvent {
            id: None,
            alias: "ping".into(),
            type_name: "Ping".into(),
            data: serde_json::json!({ "n": n }),
        }
    }

    #[test]
    fn calls_on_the_same_stream_are_coalesced() {
        let mut tracker = WorkTracker::new();
        let id = StreamId::from("quest-1");
        tracker.append(id.clone(), Some(3), NonEmpty::new(pending(1)));
        tracker.append(id.clone(), Some(9), NonEmpty::from((pending(2), vec![pending(3)])));
        tracker.append(StreamId::from("quest-2"), None, NonEmpty::new(pending(4)));

        assert_eq!(tracker.actions().len(), 2);
        let action = &tracker.actions()[0];
        assert_eq!(action.expected_version, Some(3));
        assert_eq!(action.events.len(), 3);
        assert_eq!(tracker.event_count(), 4);
    }

    #[test]
    fn start_upgrades_a_pending_append() {
        let mut tracker = WorkTracker::new();
        let id = StreamId::from("quest-1");
        tracker.append(id.clone(), None, NonEmpty::new(pending(1)));
        tracker.start(id, Some("Quest".into()), NonEmpty::new(pending(2)));

        let action = &tracker.actions()[0];
        assert_eq!(action.kind, ActionKind::Start);
        assert_eq!(action.aggregate_type.as_deref(), Some("Quest"));
        assert_eq!(action.events.len(), 2);
    }

    #[test]
    fn empty_until_something_is_queued() {
        let mut tracker = WorkTracker::new();
        assert!(tracker.is_empty());
        tracker.tombstone(StreamId::from("quest-1"));
        assert!(!tracker.is_empty());
        assert_eq!(tracker.commands()[0].stream_id(), &StreamId::from("quest-1"));
    }
}
