//! Start a stream, append to it with an expected version, aggregate it, and
//! let the projection daemon build a read model.
//!
//! Run with: `cargo run --example quickstart`

use std::time::Duration;

use eventide::{
    Aggregate, AggregateOptions, Aggregation, Apply, Create, DaemonSettings, ProjectionLifecycle,
    Repository, SingleStreamProjection, SnapshotProjection, StoreOptions, StreamId,
    store::inmemory,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct AccountOpened {
    owner: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct FundsDeposited {
    amount: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Account {
    id: String,
    owner: String,
    balance: i64,
}

impl Aggregate for Account {
    const KIND: &'static str = "Account";

    fn assign_id(&mut self, id: &StreamId) {
        self.id = id.to_string();
    }
}

impl Create<AccountOpened> for Account {
    fn create(event: &AccountOpened) -> Self {
        Self {
            owner: event.owner.clone(),
            ..Self::default()
        }
    }
}

impl Apply<FundsDeposited> for Account {
    fn apply(&mut self, event: &FundsDeposited) {
        self.balance += event.amount;
    }
}

fn account() -> Aggregation<Account> {
    Aggregation::new()
        .creates::<AccountOpened>()
        .applies::<FundsDeposited>()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = StoreOptions::new()
        .projection(SnapshotProjection::new(account()), ProjectionLifecycle::Inline)
        .projection(SingleStreamProjection::new(account()), ProjectionLifecycle::Async);
    let repo = Repository::with_options(inmemory::Store::new(), options);
    let id = Uuid::new_v4();

    let mut session = repo.session();
    session.start_stream_for::<Account>(id, [repo.wrap(AccountOpened { owner: "ada".into() })?])?;
    let summary = session.save_changes().await?;
    println!("opened {id} at sequence {:?}", summary.last_sequence());

    let mut session = repo.session();
    session.append_expected(
        id,
        1,
        [
            repo.wrap(FundsDeposited { amount: 100 })?,
            repo.wrap(FundsDeposited { amount: 25 })?,
        ],
    )?;
    session.save_changes().await?;

    let query = repo.query();
    let latest = query
        .aggregate_stream(id, &account(), AggregateOptions::default())
        .await?;
    let opening = query
        .aggregate_stream(id, &account(), AggregateOptions::default().max_version(1))
        .await?;
    println!("latest: {latest:?}");
    println!("as opened: {opening:?}");

    let daemon = repo.build_daemon(DaemonSettings::default());
    daemon.start_all().await;
    let mark = daemon.catch_up(Duration::from_secs(5)).await?;
    daemon.stop_all().await;

    let document: Option<Account> = query.load_document(Account::KIND, &id.to_string()).await?;
    println!("read model at sequence {}: {document:?}", mark.mark);
    Ok(())
}
