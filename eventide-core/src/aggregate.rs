//! Aggregate folding.
//!
//! An aggregate is a serializable state type rebuilt by folding the events of
//! one stream. Handlers are declared per event type:
//!
//! - [`Create<E>`] builds the initial state from the first handled event,
//! - [`Apply<E>`] mutates existing state,
//! - [`ShouldDelete<E>`] decides whether an event deletes the aggregate.
//!
//! An [`Aggregation`] collects those handlers into a dispatch table keyed by
//! native type name, and registers every handled type with the store's
//! [`EventRegistry`] when it is used.

use std::collections::HashMap;

use serde::{Serialize, de::DeserializeOwned};

use crate::event::{DecodeError, Event, EventRegistry, StreamId};

/// State rebuilt from the events of one stream.
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Document kind used when the aggregate is stored as a projected
    /// document, and the aggregate type recorded on started streams.
    const KIND: &'static str;

    /// Write the stream identifier into the state, if the aggregate carries
    /// one. Called after every successful fold.
    fn assign_id(&mut self, id: &StreamId) {
        let _ = id;
    }
}

/// Mutate an aggregate with a domain event.
///
/// ```ignore
/// impl Apply<MembersJoined> for QuestParty {
///     fn apply(&mut self, event: &MembersJoined) {
///         self.members.extend(event.members.iter().cloned());
///     }
/// }
/// ```
pub trait Apply<E> {
    fn apply(&mut self, event: &E);
}

/// Build a fresh aggregate from its first event.
pub trait Create<E>: Sized {
    fn create(event: &E) -> Self;
}

/// Decide whether an event deletes the aggregate.
pub trait ShouldDelete<E> {
    fn should_delete(&self, event: &E) -> bool;
}

/// Result of folding a sequence of events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Folded<A> {
    State(A),
    /// A delete handler fired and no later event rebuilt the state.
    Deleted,
    /// No handled event was seen and there was no starting state.
    Empty,
}

impl<A> Folded<A> {
    pub fn into_option(self) -> Option<A> {
        match self {
            Self::State(state) => Some(state),
            Self::Deleted | Self::Empty => None,
        }
    }
}

type CreateFn<A> = Box<dyn Fn(&Event) -> Result<A, DecodeError> + Send + Sync>;
type ApplyFn<A> = Box<dyn Fn(&mut A, &Event) -> Result<(), DecodeError> + Send + Sync>;
type DeleteFn<A> = Box<dyn Fn(&A, &Event) -> Result<bool, DecodeError> + Send + Sync>;

struct Handlers<A> {
    create: Option<CreateFn<A>>,
    apply: Option<ApplyFn<A>>,
    delete: Option<DeleteFn<A>>,
}

impl<A> Default for Handlers<A> {
    fn default() -> Self {
        Self {
            create: None,
            apply: None,
            delete: None,
        }
    }
}

/// Dispatch table folding events into an aggregate `A`.
///
/// ```ignore
/// let aggregation = Aggregation::<QuestParty>::new()
///     .creates::<QuestStarted>()
///     .applies::<MembersJoined>()
///     .deletes_on::<QuestEnded>();
/// ```
pub struct Aggregation<A> {
    /// Native type name -> handlers
    handlers: HashMap<&'static str, Handlers<A>>,
    registrars: Vec<fn(&EventRegistry)>,
}

impl<A> std::fmt::Debug for Aggregation<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregation")
            .field("handled", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<A: Aggregate> Default for Aggregation<A> {
    fn default() -> Self {
        Self::new()
    }
}

fn register<E: 'static>(registry: &EventRegistry) {
    registry.register::<E>();
}

impl<A: Aggregate> Aggregation<A> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            registrars: Vec::new(),
        }
    }

    fn entry<E: 'static>(&mut self) -> &mut Handlers<A> {
        self.registrars.push(register::<E>);
        self.handlers
            .entry(std::any::type_name::<E>())
            .or_default()
    }

    /// Handle `E` as the stream's creating event.
    #[must_use]
    pub fn creates<E>(mut self) -> Self
    where
        E: DeserializeOwned + 'static,
        A: Create<E>,
    {
        self.entry::<E>().create = Some(Box::new(|event| {
            let payload: E = event.decode()?;
            Ok(A::create(&payload))
        }));
        self
    }

    /// Handle `E` by mutating the current state. If no state exists yet, the
    /// default state is used.
    #[must_use]
    pub fn applies<E>(mut self) -> Self
    where
        E: DeserializeOwned + 'static,
        A: Apply<E>,
    {
        self.entry::<E>().apply = Some(Box::new(|state, event| {
            let payload: E = event.decode()?;
            state.apply(&payload);
            Ok(())
        }));
        self
    }

    /// Ask the state whether `E` deletes it.
    #[must_use]
    pub fn deletes_on<E>(mut self) -> Self
    where
        E: DeserializeOwned + 'static,
        A: ShouldDelete<E>,
    {
        self.entry::<E>().delete = Some(Box::new(|state, event| {
            let payload: E = event.decode()?;
            Ok(state.should_delete(&payload))
        }));
        self
    }

    /// `true` if any handler is declared for this native type name.
    #[must_use]
    pub fn handles(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }

    /// Aliases of every handled event type.
    #[must_use]
    pub fn aliases(&self, registry: &EventRegistry) -> Vec<String> {
        self.register_events(registry);
        let mut aliases: Vec<String> = self
            .handlers
            .keys()
            .filter_map(|name| registry.resolve(name).map(|d| d.alias))
            .collect();
        aliases.sort();
        aliases.dedup();
        aliases
    }

    pub fn register_events(&self, registry: &EventRegistry) {
        for registrar in &self.registrars {
            registrar(registry);
        }
    }

    /// Fold `events` on top of `state`.
    ///
    /// Events without a handler are ignored. A delete handler returning `true`
    /// drops the current state; later events start over as if the stream
    /// were new, so folding in several slices agrees with folding at once.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if a handled event's payload does not
    /// deserialize into its registered type.
    pub fn fold<'e, I>(&self, state: Option<A>, events: I) -> Result<Folded<A>, DecodeError>
    where
        I: IntoIterator<Item = &'e Event>,
    {
        let mut state = state;
        let mut deleted = false;
        for event in events {
            let Some(handlers) = self.handlers.get(event.type_name.as_str()) else {
                continue;
            };

            if let (Some(current), Some(delete)) = (state.as_ref(), handlers.delete.as_ref())
                && delete(current, event)?
            {
                tracing::trace!(sequence = event.sequence, "aggregate deleted by event");
                state = None;
                deleted = true;
                continue;
            }

            state = match (state, &handlers.create, &handlers.apply) {
                (None, Some(create), _) => Some(create(event)?),
                (None, None, Some(apply)) => {
                    let mut fresh = A::default();
                    apply(&mut fresh, event)?;
                    Some(fresh)
                }
                (Some(mut current), _, Some(apply)) => {
                    apply(&mut current, event)?;
                    Some(current)
                }
                (unchanged, _, _) => unchanged,
            };
        }
        Ok(match state {
            Some(state) => Folded::State(state),
            None if deleted => Folded::Deleted,
            None => Folded::Empty,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde::Deserialize;
    use uuid::Uuid;

    use super::*;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Party {
        name: String,
        members: Vec<String>,
    }

    impl Aggregate for Party {
        const KIND: &'static str = "party";
    }

    #[derive(Serialize, Deserialize)]
    struct Started {
        name: String,
    }

    #[derive(Serialize, Deserialize)]
    struct Joined {
        member: String,
    }

    #[derive(Serialize, Deserialize)]
    struct Disbanded;

    impl Create<Started> for Party {
        fn create(event: &Started) -> Self {
            Self {
                name: event.name.clone(),
                members: Vec::new(),
            }
        }
    }

    impl Apply<Joined> for Party {
        fn apply(&mut self, event: &Joined) {
            self.members.push(event.member.clone());
        }
    }

    impl ShouldDelete<Disbanded> for Party {
        fn should_delete(&self, _: &Disbanded) -> bool {
            true
        }
    }

    fn aggregation() -> Aggregation<Party> {
        Aggregation::new()
            .creates::<Started>()
            .applies::<Joined>()
            .deletes_on::<Disbanded>()
    }

    fn event<E: Serialize + 'static>(registry: &EventRegistry, version: i64, payload: E) -> Event {
        let pending = registry.wrap(payload).unwrap();
        Event {
            sequence: version,
            id: Uuid::new_v4(),
            stream_id: StreamId::from("party-1"),
            version,
            alias: pending.alias,
            type_name: pending.type_name,
            data: pending.data,
            timestamp: Utc::now(),
            tenant_id: "*DEFAULT*".into(),
            is_archived: false,
        }
    }

    #[test]
    fn folds_create_then_apply() {
        let registry = EventRegistry::new();
        let events = vec![
            event(&registry, 1, Started { name: "Fellowship".into() }),
            event(&registry, 2, Joined { member: "Frodo".into() }),
            event(&registry, 3, Joined { member: "Sam".into() }),
        ];

        let party = aggregation().fold(None, &events).unwrap().into_option().unwrap();
        assert_eq!(party.name, "Fellowship");
        assert_eq!(party.members, vec!["Frodo", "Sam"]);
    }

    #[test]
    fn apply_without_state_starts_from_default() {
        let registry = EventRegistry::new();
        let events = vec![event(&registry, 1, Joined { member: "Merry".into() })];

        let party = aggregation().fold(None, &events).unwrap().into_option().unwrap();
        assert_eq!(party.name, "");
        assert_eq!(party.members, vec!["Merry"]);
    }

    #[test]
    fn delete_drops_the_state() {
        let registry = EventRegistry::new();
        let events = vec![
            event(&registry, 1, Started { name: "Fellowship".into() }),
            event(&registry, 2, Disbanded),
        ];

        assert_eq!(aggregation().fold(None, &events).unwrap(), Folded::Deleted);
    }

    #[test]
    fn events_after_a_delete_start_over() {
        let registry = EventRegistry::new();
        let events = vec![
            event(&registry, 1, Started { name: "Fellowship".into() }),
            event(&registry, 2, Joined { member: "Frodo".into() }),
            event(&registry, 3, Disbanded),
            event(&registry, 4, Joined { member: "Pippin".into() }),
        ];
        let aggregation = aggregation();

        let whole = aggregation.fold(None, &events).unwrap();
        assert_eq!(
            whole,
            Folded::State(Party {
                name: String::new(),
                members: vec!["Pippin".into()],
            })
        );

        // a delete in the first slice leaves nothing to carry into the second
        let first = aggregation.fold(None, &events[..3]).unwrap();
        assert_eq!(first, Folded::Deleted);
        let sliced = aggregation.fold(first.into_option(), &events[3..]).unwrap();
        assert_eq!(sliced, whole);
    }

    #[test]
    fn unhandled_events_are_ignored() {
        #[derive(Serialize)]
        struct Unrelated;

        let registry = EventRegistry::new();
        let events = vec![event(&registry, 1, Unrelated)];
        assert_eq!(aggregation().fold(None, &events).unwrap(), Folded::Empty);

        let seed = Party {
            name: "Seeded".into(),
            members: vec![],
        };
        assert_eq!(
            aggregation().fold(Some(seed.clone()), &events).unwrap(),
            Folded::State(seed)
        );
    }

    #[test]
    fn registers_handled_types() {
        let registry = EventRegistry::new();
        let aliases = aggregation().aliases(&registry);
        assert_eq!(aliases, vec!["disbanded", "joined", "started"]);
        assert!(registry.is_registered(std::any::type_name::<Joined>()));
    }
}
