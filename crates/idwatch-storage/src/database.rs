//! Relational storage for delta rows: one table per entity type.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idwatch_core::{
    is_sql_identifier, EntityType, RecordStatus, ID_COLUMN, STATUS_COLUMN, STATUS_MAX_LEN,
    TIMESTAMP_COLUMN,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

/// Postgres caps bind parameters per statement at u16::MAX.
const MAX_BIND_PARAMS: usize = 65_535;

/// One row of a compare file as loaded into storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRow {
    pub timestamp: DateTime<Utc>,
    pub id: String,
    pub status: RecordStatus,
    /// Values in [`EntityType::attribute_columns`] order; `None` stores NULL.
    pub attributes: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MissingRecord {
    pub timestamp: DateTime<Utc>,
    pub id: String,
}

#[async_trait]
pub trait DeltaStore: Send + Sync {
    /// Drops and recreates the table and its indexes. Failure here is fatal to an import.
    async fn recreate_table(&self, table: &str, entity: EntityType) -> Result<()>;

    async fn insert_batch(&self, table: &str, entity: EntityType, rows: &[DeltaRow]) -> Result<u64>;

    /// Distinct `(timestamp, id)` pairs still marked MISSING.
    async fn missing_records(&self, table: &str) -> Result<Vec<MissingRecord>>;

    /// Flips one record from MISSING to FOUND. Returns whether a row changed.
    async fn mark_found(&self, table: &str, record: &MissingRecord) -> Result<bool>;

    async fn status_counts(&self, table: &str) -> Result<BTreeMap<String, i64>>;
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn checked_table(table: &str) -> Result<String> {
    if !is_sql_identifier(table) {
        bail!("table name {table:?} is not a plain SQL identifier");
    }
    Ok(quote_ident(table))
}

/// DDL that rebuilds `table` for `entity`, in execution order.
pub fn schema_statements(table: &str, entity: EntityType) -> Result<Vec<String>> {
    let quoted = checked_table(table)?;
    let mut columns = vec![
        "pkey BIGSERIAL PRIMARY KEY".to_string(),
        format!("{} TIMESTAMPTZ NOT NULL", quote_ident(TIMESTAMP_COLUMN)),
        format!("{} VARCHAR({}) NOT NULL", quote_ident(ID_COLUMN), entity.id_max_len()),
        format!("{} VARCHAR({STATUS_MAX_LEN}) NOT NULL", quote_ident(STATUS_COLUMN)),
    ];
    columns.extend(
        entity
            .attribute_columns()
            .iter()
            .map(|c| format!("{} VARCHAR({})", quote_ident(c.name), c.max_len)),
    );

    let mut statements = vec![
        format!("DROP TABLE IF EXISTS {quoted}"),
        format!("CREATE TABLE {quoted} ({})", columns.join(", ")),
    ];
    for column in [TIMESTAMP_COLUMN, STATUS_COLUMN, ID_COLUMN] {
        statements.push(format!(
            "CREATE INDEX {} ON {quoted} ({})",
            quote_ident(&format!("{table}_{column}")),
            quote_ident(column)
        ));
    }
    Ok(statements)
}

fn insert_columns(entity: EntityType) -> Vec<String> {
    let mut columns: Vec<String> = [TIMESTAMP_COLUMN, ID_COLUMN, STATUS_COLUMN]
        .iter()
        .map(|c| quote_ident(c))
        .collect();
    columns.extend(entity.attribute_columns().iter().map(|c| quote_ident(c.name)));
    columns
}

#[derive(Debug, Clone)]
pub struct PgDeltaStore {
    pool: PgPool,
}

impl PgDeltaStore {
    /// Builds the pool without connecting; the first query opens a connection.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_lazy(database_url)
            .context("parsing postgres url")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl DeltaStore for PgDeltaStore {
    async fn recreate_table(&self, table: &str, entity: EntityType) -> Result<()> {
        let statements = schema_statements(table, entity)?;
        let mut tx = self.pool.begin().await.context("starting schema transaction")?;
        for statement in &statements {
            debug!(table, statement = statement.as_str(), "schema statement");
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("executing schema statement for table {table}"))?;
        }
        tx.commit().await.context("committing schema transaction")?;
        info!(table, entity = %entity, "recreated delta table");
        Ok(())
    }

    async fn insert_batch(&self, table: &str, entity: EntityType, rows: &[DeltaRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let quoted = checked_table(table)?;
        let columns = insert_columns(entity);
        let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);
        let attribute_count = entity.attribute_columns().len();

        let mut inserted = 0u64;
        for chunk in rows.chunks(rows_per_statement) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {quoted} ({}) ", columns.join(", ")));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.timestamp)
                    .push_bind(row.id.clone())
                    .push_bind(row.status.as_str());
                for idx in 0..attribute_count {
                    b.push_bind(row.attributes.get(idx).cloned().flatten());
                }
            });
            let result = builder
                .build()
                .execute(&self.pool)
                .await
                .with_context(|| format!("inserting {} rows into {table}", chunk.len()))?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn missing_records(&self, table: &str) -> Result<Vec<MissingRecord>> {
        let quoted = checked_table(table)?;
        let sql = format!(
            "SELECT \"timestamp\", \"id\" FROM {quoted} WHERE \"status\" = $1 \
             GROUP BY \"timestamp\", \"id\" ORDER BY \"timestamp\", \"id\""
        );
        let rows = sqlx::query(&sql)
            .bind(RecordStatus::Missing.as_str())
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("selecting missing records from {table}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(MissingRecord {
                timestamp: row.try_get("timestamp")?,
                id: row.try_get("id")?,
            });
        }
        Ok(out)
    }

    async fn mark_found(&self, table: &str, record: &MissingRecord) -> Result<bool> {
        let quoted = checked_table(table)?;
        let sql = format!(
            "UPDATE {quoted} SET \"status\" = $1 \
             WHERE \"timestamp\" = $2 AND \"id\" = $3 AND \"status\" = $4"
        );
        let result = sqlx::query(&sql)
            .bind(RecordStatus::Found.as_str())
            .bind(record.timestamp)
            .bind(&record.id)
            .bind(RecordStatus::Missing.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("marking {} found in {table}", record.id))?;
        Ok(result.rows_affected() > 0)
    }

    async fn status_counts(&self, table: &str) -> Result<BTreeMap<String, i64>> {
        let quoted = checked_table(table)?;
        let sql = format!("SELECT \"status\", COUNT(*) AS n FROM {quoted} GROUP BY \"status\"");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("counting statuses in {table}"))?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(status, n);
        }
        Ok(counts)
    }
}

/// In-process store with the same contract, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryDeltaStore {
    tables: Mutex<HashMap<String, Vec<DeltaRow>>>,
}

impl MemoryDeltaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, table: &str) -> Vec<DeltaRow> {
        self.lock().get(table).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<DeltaRow>>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DeltaStore for MemoryDeltaStore {
    async fn recreate_table(&self, table: &str, _entity: EntityType) -> Result<()> {
        checked_table(table)?;
        self.lock().insert(table.to_string(), Vec::new());
        Ok(())
    }

    async fn insert_batch(&self, table: &str, entity: EntityType, rows: &[DeltaRow]) -> Result<u64> {
        let mut tables = self.lock();
        let Some(stored) = tables.get_mut(table) else {
            bail!("table {table} does not exist");
        };
        let width = entity.attribute_columns().len();
        for row in rows {
            if row.attributes.len() > width {
                bail!("row {} has {} attributes, table {table} has {width}", row.id, row.attributes.len());
            }
            stored.push(row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn missing_records(&self, table: &str) -> Result<Vec<MissingRecord>> {
        let tables = self.lock();
        let Some(stored) = tables.get(table) else {
            bail!("table {table} does not exist");
        };
        let mut records: Vec<MissingRecord> = stored
            .iter()
            .filter(|row| row.status == RecordStatus::Missing)
            .map(|row| MissingRecord {
                timestamp: row.timestamp,
                id: row.id.clone(),
            })
            .collect();
        records.sort();
        records.dedup();
        Ok(records)
    }

    async fn mark_found(&self, table: &str, record: &MissingRecord) -> Result<bool> {
        let mut tables = self.lock();
        let Some(stored) = tables.get_mut(table) else {
            bail!("table {table} does not exist");
        };
        let mut changed = false;
        for row in stored.iter_mut().filter(|row| {
            row.status == RecordStatus::Missing
                && row.timestamp == record.timestamp
                && row.id == record.id
        }) {
            row.status = RecordStatus::Found;
            changed = true;
        }
        Ok(changed)
    }

    async fn status_counts(&self, table: &str) -> Result<BTreeMap<String, i64>> {
        let tables = self.lock();
        let Some(stored) = tables.get(table) else {
            bail!("table {table} does not exist");
        };
        let mut counts = BTreeMap::new();
        for row in stored {
            *counts.entry(row.status.as_str().to_string()).or_insert(0i64) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(id: &str, status: RecordStatus) -> DeltaRow {
        DeltaRow {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            id: id.to_string(),
            status,
            attributes: vec![Some("x".into()), None],
        }
    }

    #[test]
    fn schema_statements_cover_table_and_indexes() {
        let statements = schema_statements("person", EntityType::Person).unwrap();
        assert_eq!(statements[0], "DROP TABLE IF EXISTS \"person\"");
        assert!(statements[1].starts_with("CREATE TABLE \"person\" (pkey BIGSERIAL PRIMARY KEY"));
        assert!(statements[1].contains("\"id\" VARCHAR(64) NOT NULL"));
        assert!(statements[1].contains("\"preferredName\" VARCHAR(1024)"));
        assert!(statements[1].contains("\"status\" VARCHAR(16) NOT NULL"));
        assert_eq!(statements.len(), 5);
        assert!(statements[2].contains("\"person_timestamp\""));
        assert!(statements[3].contains("\"person_status\""));
        assert!(statements[4].contains("\"person_id\""));
    }

    #[test]
    fn item_schema_uses_item_bounds() {
        let statements = schema_statements("item", EntityType::Item).unwrap();
        assert!(statements[1].contains("\"id\" VARCHAR(32) NOT NULL"));
        assert!(statements[1].contains("\"label\" VARCHAR(1024)"));
        assert!(statements[1].contains("\"sector_fct\" VARCHAR(16)"));
    }

    #[tokio::test]
    async fn lazy_pool_needs_no_reachable_server() {
        assert!(PgDeltaStore::connect_lazy("postgres://idwatch@127.0.0.1:1/idwatch", 2).is_ok());
        assert!(PgDeltaStore::connect_lazy("not a url", 2).is_err());
    }

    #[test]
    fn unsafe_table_names_are_rejected() {
        assert!(schema_statements("item; drop table x", EntityType::Item).is_err());
        assert!(schema_statements("Item", EntityType::Item).is_err());
    }

    #[tokio::test]
    async fn memory_store_tracks_missing_and_found() {
        let store = MemoryDeltaStore::new();
        store.recreate_table("organization", EntityType::Organization).await.unwrap();
        let rows = vec![
            row("b", RecordStatus::Missing),
            row("a", RecordStatus::Missing),
            row("a", RecordStatus::Missing),
            row("c", RecordStatus::New),
        ];
        assert_eq!(store.insert_batch("organization", EntityType::Organization, &rows).await.unwrap(), 4);

        let missing = store.missing_records("organization").await.unwrap();
        assert_eq!(missing.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);

        assert!(store.mark_found("organization", &missing[0]).await.unwrap());
        assert!(!store.mark_found("organization", &missing[0]).await.unwrap());

        let counts = store.status_counts("organization").await.unwrap();
        assert_eq!(counts.get("FOUND"), Some(&2));
        assert_eq!(counts.get("MISSING"), Some(&1));
        assert_eq!(counts.get("NEW"), Some(&1));
    }

    #[tokio::test]
    async fn recreate_clears_previous_rows() {
        let store = MemoryDeltaStore::new();
        store.recreate_table("person", EntityType::Person).await.unwrap();
        store
            .insert_batch("person", EntityType::Person, &[row("a", RecordStatus::New)])
            .await
            .unwrap();
        store.recreate_table("person", EntityType::Person).await.unwrap();
        assert!(store.rows("person").is_empty());
        assert!(store.missing_records("absent").await.is_err());
    }
}
