//! Integration tests for the `PostgreSQL` store.
//!
//! These tests require Docker to be running and will spin up a `PostgreSQL`
//! container using testcontainers.

use std::time::Duration;

use eventide_core::{
    aggregate::{Aggregate, Aggregation, Apply, Create},
    daemon::DaemonSettings,
    event::{StreamId, StreamIdentity},
    options::{ProjectionLifecycle, StoreOptions},
    projection::{SingleStreamProjection, SnapshotProjection},
    repository::{AggregateOptions, Repository},
    session::SessionError,
    store::{EventFilter, EventStore, StoreTransaction, StreamRange},
};
use eventide_postgres::Store;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Test helper to set up a `PostgreSQL` container and connection pool.
struct TestDb {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestDb {
    async fn new() -> Self {
        let container = Postgres::default().start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(5432).await.unwrap();

        let connection_string = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let pool = PgPool::connect(&connection_string).await.unwrap();

        Self {
            _container: container,
            pool,
        }
    }

    async fn store(&self, identity: StreamIdentity) -> Store {
        let store = Store::with_identity(self.pool.clone(), identity);
        store.migrate().await.unwrap();
        store
    }

    async fn repo(&self, identity: StreamIdentity) -> Repository<Store> {
        let options = StoreOptions::new().identity(identity);
        Repository::with_options(self.store(identity).await, options)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct Ledger {
    owner: String,
    balance: i64,
}

impl Aggregate for Ledger {
    const KIND: &'static str = "Ledger";
}

#[derive(Serialize, Deserialize)]
struct LedgerOpened {
    owner: String,
}

#[derive(Serialize, Deserialize)]
struct Deposited {
    amount: i64,
}

impl Create<LedgerOpened> for Ledger {
    fn create(event: &LedgerOpened) -> Self {
        Self {
            owner: event.owner.clone(),
            balance: 0,
        }
    }
}

impl Apply<Deposited> for Ledger {
    fn apply(&mut self, event: &Deposited) {
        self.balance += event.amount;
    }
}

fn aggregation() -> Aggregation<Ledger> {
    Aggregation::new()
        .creates::<LedgerOpened>()
        .applies::<Deposited>()
}

#[tokio::test]
async fn migrate_creates_tables() {
    let db = TestDb::new().await;
    let _store = db.store(StreamIdentity::AsGuid).await;

    for table in ["events", "streams", "event_progression", "projected_documents"] {
        let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0, "{table} should start empty");
    }
}

#[tokio::test]
async fn migrate_is_idempotent() {
    let db = TestDb::new().await;
    let store = db.store(StreamIdentity::AsGuid).await;
    store.migrate().await.unwrap();
    store.migrate().await.unwrap();
}

#[tokio::test]
async fn start_then_append_assigns_versions_and_sequences() {
    let db = TestDb::new().await;
    let repo = db.repo(StreamIdentity::AsGuid).await;
    let id = Uuid::new_v4();

    let mut session = repo.session();
    session
        .start_stream_for::<Ledger>(
            id,
            [
                repo.wrap(LedgerOpened { owner: "ada".into() }).unwrap(),
                repo.wrap(Deposited { amount: 10 }).unwrap(),
            ],
        )
        .unwrap();
    let first = session.save_changes().await.unwrap();

    let mut session = repo.session();
    session
        .append_expected(id, 2, [repo.wrap(Deposited { amount: 5 }).unwrap()])
        .unwrap();
    let second = session.save_changes().await.unwrap();

    assert_eq!(first.streams[0].version, 2);
    assert_eq!(second.streams[0].version, 3);
    assert!(second.last_sequence() > first.last_sequence());

    let query = repo.query();
    let state = query.fetch_stream_state(id).await.unwrap().unwrap();
    assert_eq!(state.version, 3);
    assert_eq!(state.aggregate_type.as_deref(), Some("Ledger"));

    let events = query.fetch_stream(id).await.unwrap();
    let versions: Vec<i64> = events.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(events[0].alias, "ledger_opened");

    let ledger = query
        .aggregate_stream(id, &aggregation(), AggregateOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ledger.balance, 15);
}

#[tokio::test]
async fn starting_an_existing_stream_collides() {
    let db = TestDb::new().await;
    let repo = db.repo(StreamIdentity::AsGuid).await;
    let id = Uuid::new_v4();

    for attempt in 0..2 {
        let mut session = repo.session();
        session
            .start_stream(id, [repo.wrap(LedgerOpened { owner: "ada".into() }).unwrap()])
            .unwrap();
        let result = session.save_changes().await;
        if attempt == 0 {
            result.unwrap();
        } else {
            assert!(matches!(result, Err(SessionError::StreamIdCollision(_))));
        }
    }
}

#[tokio::test]
async fn stale_expected_version_changes_nothing() {
    let db = TestDb::new().await;
    let repo = db.repo(StreamIdentity::AsString).await;

    let mut session = repo.session();
    session
        .start_stream("acct-1", [repo.wrap(LedgerOpened { owner: "ada".into() }).unwrap()])
        .unwrap();
    session.save_changes().await.unwrap();

    let mut session = repo.session();
    session
        .append_expected("acct-1", 4, [repo.wrap(Deposited { amount: 1 }).unwrap()])
        .unwrap();
    let error = session.save_changes().await.unwrap_err();
    match error {
        SessionError::UnexpectedVersion(conflict) => {
            assert_eq!(conflict.expected, 4);
            assert_eq!(conflict.actual, 1);
        }
        other => panic!("expected a version conflict, got {other:?}"),
    }

    let state = repo.query().fetch_stream_state("acct-1").await.unwrap().unwrap();
    assert_eq!(state.version, 1);
    assert_eq!(repo.store().highest_sequence().await.unwrap(), 1);
}

/// Append `count` deposits in one unit of work and return the versions they
/// were given.
async fn deposit(
    repo: &Repository<Store>,
    id: &str,
    expected: Option<i64>,
    count: i64,
) -> Result<Vec<i64>, SessionError<eventide_postgres::Error>> {
    let events: Vec<_> = (1..=count)
        .map(|amount| repo.wrap(Deposited { amount }).unwrap())
        .collect();
    let mut session = repo.session();
    match expected {
        Some(version) => session.append_expected(id, version, events)?,
        None => session.append(id, events)?,
    }
    let summary = session.save_changes().await?;
    let committed = summary.stream(&StreamId::from(id)).unwrap();
    Ok(((committed.version - count + 1)..=committed.version).collect())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_appenders_receive_disjoint_versions() {
    let db = TestDb::new().await;
    let repo = db.repo(StreamIdentity::AsString).await;
    let mut session = repo.session();
    session
        .start_stream("acct-1", [repo.wrap(LedgerOpened { owner: "ada".into() }).unwrap()])
        .unwrap();
    session.save_changes().await.unwrap();

    let (left, right) = tokio::join!(
        deposit(&repo, "acct-1", None, 2),
        deposit(&repo, "acct-1", None, 3)
    );
    let mut versions: Vec<i64> = left.unwrap().into_iter().chain(right.unwrap()).collect();
    versions.sort_unstable();
    assert_eq!(versions, vec![2, 3, 4, 5, 6]);

    let stored: Vec<i64> = repo
        .query()
        .fetch_stream("acct-1")
        .await
        .unwrap()
        .iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(stored, vec![1, 2, 3, 4, 5, 6]);
    let state = repo.query().fetch_stream_state("acct-1").await.unwrap().unwrap();
    assert_eq!(state.version, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn only_one_appender_wins_an_expected_version() {
    let db = TestDb::new().await;
    let repo = db.repo(StreamIdentity::AsString).await;
    let mut session = repo.session();
    session
        .start_stream("acct-1", [repo.wrap(LedgerOpened { owner: "ada".into() }).unwrap()])
        .unwrap();
    session.save_changes().await.unwrap();

    let (left, right) = tokio::join!(
        deposit(&repo, "acct-1", Some(1), 1),
        deposit(&repo, "acct-1", Some(1), 1)
    );
    let (won, lost) = match (left, right) {
        (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
        other => panic!("exactly one appender should win, got {other:?}"),
    };
    assert_eq!(won, vec![2]);
    match lost {
        SessionError::UnexpectedVersion(conflict) => {
            assert_eq!(conflict.expected, 1);
            assert_eq!(conflict.actual, 2);
        }
        other => panic!("expected a version conflict, got {other:?}"),
    }
    let state = repo.query().fetch_stream_state("acct-1").await.unwrap().unwrap();
    assert_eq!(state.version, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn appender_waits_for_the_stream_row_lock() {
    let db = TestDb::new().await;
    let repo = db.repo(StreamIdentity::AsString).await;
    let mut session = repo.session();
    session
        .start_stream("acct-1", [repo.wrap(LedgerOpened { owner: "ada".into() }).unwrap()])
        .unwrap();
    session.save_changes().await.unwrap();

    let mut holder = repo.store().begin().await.unwrap();
    let locked = holder
        .lock_stream("*DEFAULT*", &StreamId::from("acct-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(locked.version, 1);

    let appender = {
        let repo = repo.clone();
        tokio::spawn(async move { deposit(&repo, "acct-1", Some(1), 1).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!appender.is_finished(), "append must block on the row lock");

    holder.commit().await.unwrap();
    let versions = appender.await.unwrap().unwrap();
    assert_eq!(versions, vec![2]);
}

#[tokio::test]
async fn archive_and_tombstone() {
    let db = TestDb::new().await;
    let repo = db.repo(StreamIdentity::AsString).await;

    let mut session = repo.session();
    session
        .start_stream("a", [repo.wrap(LedgerOpened { owner: "a".into() }).unwrap()])
        .unwrap();
    session
        .start_stream("t", [repo.wrap(LedgerOpened { owner: "t".into() }).unwrap()])
        .unwrap();
    session.save_changes().await.unwrap();

    let mut session = repo.session();
    session.archive_stream("a").unwrap();
    session.tombstone_stream("t").unwrap();
    session.save_changes().await.unwrap();

    let mut session = repo.session();
    session
        .append("a", [repo.wrap(Deposited { amount: 1 }).unwrap()])
        .unwrap();
    assert!(matches!(
        session.save_changes().await,
        Err(SessionError::StreamArchived(_))
    ));

    let visible = repo
        .store()
        .load_events_between(0, 10, 10, &EventFilter::all())
        .await
        .unwrap();
    assert!(visible.is_empty());
    let archived = repo
        .store()
        .load_events_between(0, 10, 10, &EventFilter::all().including_archived())
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);

    let mut session = repo.session();
    session
        .start_stream("t", [repo.wrap(LedgerOpened { owner: "t2".into() }).unwrap()])
        .unwrap();
    let summary = session.save_changes().await.unwrap();
    assert_eq!(summary.streams[0].version, 1);
}

#[tokio::test]
async fn rolled_back_transaction_leaves_a_gap_in_sequences() {
    let db = TestDb::new().await;
    let repo = db.repo(StreamIdentity::AsString).await;

    let mut session = repo.session();
    session
        .start_stream("s", [repo.wrap(LedgerOpened { owner: "s".into() }).unwrap()])
        .unwrap();
    session.save_changes().await.unwrap();

    // "u" is written and draws sequence 2 before "s" collides
    let mut session = repo.session();
    session
        .start_stream("u", [repo.wrap(LedgerOpened { owner: "u".into() }).unwrap()])
        .unwrap();
    session
        .start_stream("s", [repo.wrap(LedgerOpened { owner: "again".into() }).unwrap()])
        .unwrap();
    session.save_changes().await.unwrap_err();

    let mut session = repo.session();
    session
        .append("s", [repo.wrap(Deposited { amount: 1 }).unwrap()])
        .unwrap();
    let summary = session.save_changes().await.unwrap();

    assert!(repo.query().fetch_stream_state("u").await.unwrap().is_none());
    assert_eq!(summary.last_sequence(), Some(3));
}

#[tokio::test]
async fn inline_snapshot_is_written_in_the_same_transaction() {
    let db = TestDb::new().await;
    let options = StoreOptions::new()
        .identity(StreamIdentity::AsString)
        .projection(SnapshotProjection::new(aggregation()), ProjectionLifecycle::Inline);
    let repo = Repository::with_options(db.store(StreamIdentity::AsString).await, options);

    let mut session = repo.session();
    session
        .start_stream(
            "acct",
            [
                repo.wrap(LedgerOpened { owner: "ada".into() }).unwrap(),
                repo.wrap(Deposited { amount: 7 }).unwrap(),
            ],
        )
        .unwrap();
    session.save_changes().await.unwrap();

    let snapshot = repo
        .store()
        .load_snapshot("*DEFAULT*", &"acct".into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.version, 2);
    assert_eq!(snapshot.data["balance"], 7);

    let state = repo.query().fetch_stream_state("acct").await.unwrap().unwrap();
    assert_eq!(state.snapshot_version, Some(2));

    let early = repo
        .query()
        .aggregate_stream("acct", &aggregation(), AggregateOptions::default().max_version(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(early.balance, 0);
}

#[tokio::test]
async fn progress_updates_check_the_floor() {
    let db = TestDb::new().await;
    let store = db.store(StreamIdentity::AsGuid).await;

    let mut tx = store.begin().await.unwrap();
    assert!(tx.insert_progress("Ledger:All", 5).await.unwrap());
    assert!(!tx.insert_progress("Ledger:All", 6).await.unwrap());
    assert!(tx.update_progress("Ledger:All", 5, 9).await.unwrap());
    assert!(!tx.update_progress("Ledger:All", 5, 12).await.unwrap());
    tx.commit().await.unwrap();

    store.rewind_progress("Ledger:All", 2).await.unwrap();
    let progress = store.fetch_progress("Ledger:All").await.unwrap().unwrap();
    assert_eq!(progress.sequence, 2);
    assert_eq!(store.all_progress().await.unwrap().len(), 1);
}

#[tokio::test]
async fn high_water_row_never_regresses() {
    let db = TestDb::new().await;
    let store = db.store(StreamIdentity::AsGuid).await;
    let start = chrono::Utc::now();

    let row = store.save_high_water(10, 12, start).await.unwrap();
    assert_eq!(row.mark, 10);

    let later = start + chrono::Duration::seconds(5);
    let row = store.save_high_water(8, 12, later).await.unwrap();
    assert_eq!(row.mark, 10);
    // still stuck behind the gap at 11
    assert_eq!(row.last_updated.timestamp(), start.timestamp());

    let row = store.save_high_water(12, 12, later).await.unwrap();
    assert_eq!(row.mark, 12);
    assert_eq!(row.last_updated.timestamp(), later.timestamp());
    assert!(store.all_progress().await.unwrap().is_empty());
}

#[tokio::test]
async fn daemon_projects_documents_asynchronously() {
    let db = TestDb::new().await;
    let options = StoreOptions::new().projection(
        SingleStreamProjection::new(aggregation()),
        ProjectionLifecycle::Async,
    );
    let repo = Repository::with_options(db.store(StreamIdentity::AsGuid).await, options);
    let id = Uuid::new_v4();

    let mut session = repo.session();
    session
        .start_stream(
            id,
            [
                repo.wrap(LedgerOpened { owner: "ada".into() }).unwrap(),
                repo.wrap(Deposited { amount: 3 }).unwrap(),
            ],
        )
        .unwrap();
    session.save_changes().await.unwrap();

    let daemon = repo.build_daemon(
        DaemonSettings::default()
            .poll_interval(Duration::from_millis(20))
            .detection_interval(Duration::from_millis(20)),
    );
    daemon.start_all().await;
    daemon.catch_up(Duration::from_secs(10)).await.unwrap();
    daemon.stop_all().await;

    let ledger: Ledger = repo
        .query()
        .load_document("Ledger", &id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ledger.balance, 3);

    let progress = repo.store().fetch_progress("Ledger:All").await.unwrap().unwrap();
    assert_eq!(progress.sequence, 2);
    assert_eq!(
        repo.store()
            .fetch_stream("*DEFAULT*", &id.into(), &StreamRange::all())
            .await
            .unwrap()
            .len(),
        2
    );
}
