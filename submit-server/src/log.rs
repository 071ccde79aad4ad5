// ABOUTME: Authoritative input log backed by PostgreSQL
// ABOUTME: Applies submitted inputs with server authority inside one transaction

use anyhow::Context;
use async_trait::async_trait;
use postgres_native_tls::MakeTlsConnector;
use shape_sync::domain::{plan_input, schema_sql, seed_sql, PlannedStatement, WriteAuthority};
use shape_sync::{SqlValue, SyncError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("{0}")]
    Input(#[from] SyncError),

    #[error("{0}")]
    Database(#[from] tokio_postgres::Error),
}

/// Destination for submitted inputs.
#[async_trait]
pub trait InputLog: Send + Sync {
    /// Apply every input, all or nothing.
    async fn append_inputs(&self, inputs: &[String]) -> Result<(), LogError>;
}

/// Writes inputs into the `input`/`mutable` tables of the source database.
pub struct PgInputLog {
    client: Mutex<Client>,
    player_id: i64,
}

impl PgInputLog {
    /// Connect over TLS-capable transport; plain connections still work when
    /// the server does not require TLS.
    pub async fn connect(database_url: &str, player_id: i64) -> anyhow::Result<Self> {
        let connector = native_tls::TlsConnector::builder()
            .build()
            .context("Failed to build TLS connector")?;
        let tls = MakeTlsConnector::new(connector);
        let (client, connection) = tokio_postgres::connect(database_url, tls)
            .await
            .context("Failed to connect to PostgreSQL")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Self::from_client(client, player_id))
    }

    pub fn from_client(client: Client, player_id: i64) -> Self {
        Self {
            client: Mutex::new(client),
            player_id,
        }
    }

    /// Create and seed the demo tables unless both already exist.
    pub async fn bootstrap(&self) -> anyhow::Result<bool> {
        let mut client = self.client.lock().await;
        let row = client
            .query_one(
                "SELECT to_regclass('input') IS NOT NULL AND to_regclass('mutable') IS NOT NULL",
                &[],
            )
            .await
            .context("Failed to check for existing tables")?;
        let present: bool = row.get(0);
        if present {
            return Ok(false);
        }

        let tx = client.transaction().await?;
        tx.batch_execute(schema_sql())
            .await
            .context("Failed to create schema")?;
        tx.batch_execute(seed_sql())
            .await
            .context("Failed to load seed data")?;
        tx.commit().await?;
        tracing::info!("Created and seeded input/mutable tables");
        Ok(true)
    }
}

#[async_trait]
impl InputLog for PgInputLog {
    async fn append_inputs(&self, inputs: &[String]) -> Result<(), LogError> {
        // Plan everything first so a bad input never opens a transaction
        let mut plans: Vec<PlannedStatement> = Vec::new();
        for input in inputs {
            plans.extend(plan_input(input, self.player_id, WriteAuthority::Server)?);
        }
        let params = plans
            .iter()
            .map(|stmt| to_pg_params(&stmt.params))
            .collect::<Result<Vec<_>, _>>()?;

        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        for (stmt, values) in plans.iter().zip(&params) {
            let refs: Vec<&(dyn ToSql + Sync)> = values
                .iter()
                .map(|v| v.as_ref() as &(dyn ToSql + Sync))
                .collect();
            tx.execute(stmt.sql.as_str(), &refs).await?;
        }
        tx.commit().await?;

        tracing::info!("Appended {} input(s) ({} statements)", inputs.len(), plans.len());
        Ok(())
    }
}

/// Box plan parameters for tokio-postgres.
///
/// Integer placeholders are cast to `INTEGER`, so they bind as `i32`.
pub fn to_pg_params(values: &[SqlValue]) -> Result<Vec<Box<dyn ToSql + Sync + Send>>, SyncError> {
    values
        .iter()
        .map(|value| -> Result<Box<dyn ToSql + Sync + Send>, SyncError> {
            let boxed: Box<dyn ToSql + Sync + Send> = match value {
                SqlValue::Null => Box::new(None::<i32>),
                SqlValue::Integer(i) => Box::new(i32::try_from(*i).map_err(|_| {
                    SyncError::InvalidInput(format!("{} does not fit in an INTEGER column", i))
                })?),
                SqlValue::Real(f) => Box::new(*f),
                SqlValue::Text(s) => Box::new(s.clone()),
            };
            Ok(boxed)
        })
        .collect()
}
