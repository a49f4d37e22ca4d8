//! Event envelopes and the event type registry.
//!
//! Domain events are plain serde types. The [`EventRegistry`] maps each native
//! type to a stable alias (`QuestStarted` becomes `quest_started`) and wraps
//! payloads into [`PendingEvent`]s. The stream writer later turns those into
//! durable [`Event`]s carrying id, version, sequence, timestamp and tenant.

use std::{any::TypeId, collections::HashMap, fmt, sync::RwLock};

use chrono::{DateTime, Utc};
use heck::ToSnakeCase;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use uuid::Uuid;

/// Identifier of an event stream.
///
/// Whether streams are keyed by UUID or by string is a store-wide choice (see
/// [`StreamIdentity`]); a store never mixes the two.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamId {
    Guid(Uuid),
    Key(String),
}

impl StreamId {
    /// `true` for the nil UUID and for blank string keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Guid(id) => id.is_nil(),
            Self::Key(key) => key.trim().is_empty(),
        }
    }

    /// The identity kind this identifier belongs to.
    #[must_use]
    pub const fn identity(&self) -> StreamIdentity {
        match self {
            Self::Guid(_) => StreamIdentity::AsGuid,
            Self::Key(_) => StreamIdentity::AsString,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guid(id) => id.fmt(f),
            Self::Key(key) => f.write_str(key),
        }
    }
}

impl From<Uuid> for StreamId {
    fn from(id: Uuid) -> Self {
        Self::Guid(id)
    }
}

impl From<String> for StreamId {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<&str> for StreamId {
    fn from(key: &str) -> Self {
        Self::Key(key.to_owned())
    }
}

/// Store-wide choice of stream identifier type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamIdentity {
    /// Streams are identified by [`Uuid`].
    #[default]
    AsGuid,
    /// Streams are identified by an arbitrary string key.
    AsString,
}

/// Stable naming for one registered event type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    /// Persisted alias, e.g. `quest_started`.
    pub alias: String,
    /// Native type name used to resolve the payload type on read.
    pub type_name: String,
}

impl TypeDescriptor {
    #[must_use]
    pub fn of<E: ?Sized + 'static>() -> Self {
        let type_name = std::any::type_name::<E>();
        Self {
            alias: alias_for(type_name),
            type_name: type_name.to_owned(),
        }
    }
}

/// Derive the persisted alias from a native type name.
///
/// Module paths and generic arguments are dropped, the remaining PascalCase
/// identifier is converted to snake_case.
///
/// ```
/// use eventide_core::event::alias_for;
///
/// assert_eq!(alias_for("quests::events::QuestStarted"), "quest_started");
/// assert_eq!(alias_for("MembersJoined"), "members_joined");
/// ```
#[must_use]
pub fn alias_for(type_name: &str) -> String {
    let without_generics = type_name.split('<').next().unwrap_or(type_name);
    let short = without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics);
    short.to_snake_case()
}

/// What to do with a stored event whose native type is not registered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnknownEventPolicy {
    /// Drop the event from the replay and log a warning.
    #[default]
    Skip,
    /// Abort the read with [`UnknownEventType`].
    Fail,
}

/// A stored event could not be resolved to a registered type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("event at sequence {sequence} has unresolvable type `{type_name}`")]
pub struct UnknownEventType {
    pub sequence: i64,
    pub type_name: String,
}

/// A stored payload failed to deserialize into its registered type.
#[derive(Debug, Error)]
#[error("failed to decode event at sequence {sequence} as `{type_name}`: {source}")]
pub struct DecodeError {
    pub sequence: i64,
    pub type_name: String,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, Default)]
struct Registered {
    by_type: HashMap<TypeId, TypeDescriptor>,
    by_name: HashMap<String, TypeDescriptor>,
}

/// Registry of event types known to a store.
///
/// Registration is memoized for the lifetime of the registry: the first
/// descriptor computed for a type wins and is never evicted.
#[derive(Debug, Default)]
pub struct EventRegistry {
    inner: RwLock<Registered>,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E`, or return its existing descriptor.
    pub fn register<E: 'static>(&self) -> TypeDescriptor {
        let type_id = TypeId::of::<E>();
        if let Some(descriptor) = self
            .inner
            .read()
            .expect("event registry lock poisoned")
            .by_type
            .get(&type_id)
        {
            return descriptor.clone();
        }

        let mut inner = self.inner.write().expect("event registry lock poisoned");
        let descriptor = inner
            .by_type
            .entry(type_id)
            .or_insert_with(TypeDescriptor::of::<E>)
            .clone();
        inner
            .by_name
            .entry(descriptor.type_name.clone())
            .or_insert_with(|| descriptor.clone());
        drop(inner);

        tracing::trace!(alias = %descriptor.alias, type_name = %descriptor.type_name, "event type registered");
        descriptor
    }

    /// Resolve a stored native type name.
    #[must_use]
    pub fn resolve(&self, type_name: &str) -> Option<TypeDescriptor> {
        self.inner
            .read()
            .expect("event registry lock poisoned")
            .by_name
            .get(type_name)
            .cloned()
    }

    #[must_use]
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.inner
            .read()
            .expect("event registry lock poisoned")
            .by_name
            .contains_key(type_name)
    }

    /// Wrap a raw payload into a [`PendingEvent`], registering its type.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the payload cannot be converted to JSON.
    pub fn wrap<E>(&self, payload: E) -> Result<PendingEvent, serde_json::Error>
    where
        E: Serialize + 'static,
    {
        let descriptor = self.register::<E>();
        let data = serde_json::to_value(&payload)?;
        Ok(PendingEvent {
            id: None,
            alias: descriptor.alias,
            type_name: descriptor.type_name,
            data,
        })
    }

    /// Apply `policy` to events whose native type is not registered.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownEventType`] for the first unresolvable event when the
    /// policy is [`UnknownEventPolicy::Fail`].
    pub fn screen(
        &self,
        events: Vec<Event>,
        policy: UnknownEventPolicy,
    ) -> Result<Vec<Event>, UnknownEventType> {
        let inner = self.inner.read().expect("event registry lock poisoned");
        let mut screened = Vec::with_capacity(events.len());
        for event in events {
            if inner.by_name.contains_key(&event.type_name) {
                screened.push(event);
                continue;
            }
            match policy {
                UnknownEventPolicy::Skip => {
                    tracing::warn!(
                        sequence = event.sequence,
                        type_name = %event.type_name,
                        "skipping event with unresolvable type"
                    );
                }
                UnknownEventPolicy::Fail => {
                    return Err(UnknownEventType {
                        sequence: event.sequence,
                        type_name: event.type_name,
                    });
                }
            }
        }
        Ok(screened)
    }
}

/// A wrapped payload waiting to be written by the stream writer.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingEvent {
    /// Client-assigned id; a fresh v4 id is generated at commit if absent.
    pub id: Option<Uuid>,
    pub alias: String,
    pub type_name: String,
    pub data: serde_json::Value,
}

impl PendingEvent {
    #[must_use]
    pub const fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }
}

/// A durable event as stored in the `events` table.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Global, server-assigned sequence.
    pub sequence: i64,
    pub id: Uuid,
    pub stream_id: StreamId,
    /// 1-based position within the stream.
    pub version: i64,
    pub alias: String,
    pub type_name: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub is_archived: bool,
}

impl Event {
    /// `true` if this event was written from a payload of type `E`.
    #[must_use]
    pub fn is<E: 'static>(&self) -> bool {
        self.type_name == std::any::type_name::<E>()
    }

    /// Deserialize the payload as `E`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the payload does not match `E`.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, DecodeError> {
        E::deserialize(&self.data).map_err(|source| DecodeError {
            sequence: self.sequence,
            type_name: self.type_name.clone(),
            source,
        })
    }
}
