//! Two writers race on one stream; the loser sees the version it missed and
//! retries.
//!
//! Run with: `cargo run --example optimistic_concurrency`

use eventide::{Repository, SessionError, StoreOptions, StreamIdentity, store::inmemory};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct ItemReserved {
    sku: String,
    quantity: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let repo = Repository::with_options(
        inmemory::Store::new(),
        StoreOptions::new().identity(StreamIdentity::AsString),
    );
    let reserve = |quantity| {
        repo.wrap(ItemReserved {
            sku: "widget".into(),
            quantity,
        })
    };

    let mut session = repo.session();
    session.start_stream("inventory-widget", [reserve(1)?])?;
    session.save_changes().await?;

    // both writers read version 1
    let seen = repo
        .query()
        .fetch_stream_state("inventory-widget")
        .await?
        .map_or(0, |state| state.version);

    let mut first = repo.session();
    first.append_expected("inventory-widget", seen, [reserve(2)?])?;
    let mut second = repo.session();
    second.append_expected("inventory-widget", seen, [reserve(3)?])?;

    first.save_changes().await?;
    match second.save_changes().await {
        Err(SessionError::UnexpectedVersion(conflict)) => {
            println!("conflict: {conflict}; retrying at version {}", conflict.actual);
            let mut retry = repo.session();
            retry.append_expected("inventory-widget", conflict.actual, [reserve(3)?])?;
            let summary = retry.save_changes().await?;
            println!("stream now at version {}", summary.streams[0].version);
        }
        other => {
            other?;
        }
    }
    Ok(())
}
