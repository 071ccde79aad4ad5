// ABOUTME: Local store commands - init, stage, submit, discard, show, pending
// ABOUTME: Operate on the SQLite replica and the outbox without running the sync loop

use anyhow::{Context, Result};

use super::{install_rollback, open_store};
use crate::config::SyncConfig;
use crate::domain::schema_sql;
use crate::outbox::Outbox;
use crate::store::SqlValue;
use crate::submit::{submit_pending, SubmitClient};
use crate::utils::{quote_ident, validate_identifier};

/// Create the demo tables, the outbox and the rollback ledger.
pub async fn init(config: &SyncConfig) -> Result<()> {
    let store = open_store(config)?;
    store
        .execute_batch(schema_sql())
        .context("Failed to create local schema")?;
    Outbox::open(store.clone(), config.player_id).context("Failed to create outbox")?;
    let handle = install_rollback(config, &store)?;

    let location = store
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| ":memory:".to_string());
    println!("Initialized local store at {}", location);
    println!("Tracking local writes in: {}", handle.tables().join(", "));
    Ok(())
}

/// Apply an input optimistically and queue it for submission.
pub async fn stage(config: &SyncConfig, input: &str) -> Result<()> {
    let store = open_store(config)?;
    let outbox = Outbox::open(store, config.player_id).context("Failed to open outbox")?;
    match outbox
        .stage_input(input)
        .with_context(|| format!("Failed to stage input '{}'", input))?
    {
        Some(staged) => println!("Staged '{}' as local event {}", staged.input, staged.event_id),
        None => println!("Nothing to stage: input is empty"),
    }
    Ok(())
}

/// Send every queued input to the submission endpoint.
pub async fn submit(config: &SyncConfig) -> Result<()> {
    let store = open_store(config)?;
    let outbox = Outbox::open(store, config.player_id).context("Failed to open outbox")?;
    let client = SubmitClient::new(&config.submit_url, config.request_timeout())?;
    let submitted = submit_pending(&client, &outbox)
        .await
        .with_context(|| format!("Failed to submit pending inputs to {}", config.submit_url))?;
    if submitted == 0 {
        println!("No pending inputs to submit");
    } else {
        println!("Submitted {} input(s)", submitted);
    }
    Ok(())
}

/// Throw away every unconfirmed local write and empty the outbox.
pub async fn discard(config: &SyncConfig) -> Result<()> {
    let store = open_store(config)?;
    let handle = install_rollback(config, &store)?;
    let outbox = Outbox::open(store, config.player_id).context("Failed to open outbox")?;

    let report = handle.rollback().context("Failed to roll back local writes")?;
    let cleared = outbox.clear_pending().context("Failed to clear outbox")?;
    println!(
        "Discarded {} local event(s): {} row(s) deleted, {} queued input(s) dropped",
        report.events_discarded, report.rows_deleted, cleared
    );
    Ok(())
}

/// Print every row of a local table, tab separated.
pub async fn show(config: &SyncConfig, table: &str) -> Result<()> {
    validate_identifier(table)?;
    let store = open_store(config)?;
    if !store.table_exists(table)? {
        anyhow::bail!("Table '{}' does not exist in the local store", table);
    }
    let rows = store
        .query(&format!("SELECT * FROM {} ORDER BY rowid", quote_ident(table)), &[])
        .with_context(|| format!("Failed to read table '{}'", table))?;

    let Some(first) = rows.first() else {
        println!("(no rows)");
        return Ok(());
    };
    let columns: Vec<&String> = first.keys().collect();
    println!(
        "{}",
        columns
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join("\t")
    );
    for row in &rows {
        let values: Vec<String> = columns
            .iter()
            .map(|c| row.get(*c).map(SqlValue::to_string).unwrap_or_default())
            .collect();
        println!("{}", values.join("\t"));
    }
    println!("({} row(s))", rows.len());
    Ok(())
}

/// List queued inputs and unconfirmed ledger entries.
pub async fn pending(config: &SyncConfig) -> Result<()> {
    let store = open_store(config)?;
    let outbox = Outbox::open(store.clone(), config.player_id).context("Failed to open outbox")?;
    let handle = install_rollback(config, &store)?;

    let inputs = outbox.pending_inputs()?;
    if inputs.is_empty() {
        println!("No queued inputs");
    } else {
        println!("Queued inputs:");
        for staged in &inputs {
            println!("  [{}] {} (staged {})", staged.event_id, staged.input, staged.staged_at);
        }
    }

    let events = handle.pending_events()?;
    if events.is_empty() {
        println!("No unconfirmed local events");
    } else {
        let ids: Vec<String> = events.iter().map(ToString::to_string).collect();
        println!("Unconfirmed local events: {}", ids.join(", "));
    }
    Ok(())
}
