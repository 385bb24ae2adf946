//! Import: rebuild one entity table from every valid compare file.

use std::path::Path;

use anyhow::anyhow;
use csv::StringRecord;
use idwatch_core::{
    parse_timestamp, truncate_chars, EntityDescriptor, EntityType, RecordStatus, ID_COLUMN,
    STATUS_COLUMN, STATUS_MAX_LEN, TIMESTAMP_COLUMN,
};
use idwatch_storage::{open_gz_csv, DeltaRow, DeltaStore, ListOrder, SnapshotStore};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};

use crate::PipelineError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub files: usize,
    pub failed_files: usize,
    pub rows: u64,
}

/// Drops and recreates the table, then loads compare files oldest first.
///
/// Only the schema rebuild is fatal; a file that fails to load is logged
/// and skipped, since the next run rebuilds the table from scratch anyway.
pub async fn run_import(
    store: &SnapshotStore,
    db: &dyn DeltaStore,
    descriptor: &EntityDescriptor,
    batch_size: usize,
) -> Result<ImportSummary, PipelineError> {
    descriptor.validate()?;
    let span = info_span!("import", entity = %descriptor.entity, table = descriptor.table_name.as_str());
    async move {
        let table = descriptor.table_name.as_str();
        db.recreate_table(table, descriptor.entity)
            .await
            .map_err(|source| PipelineError::Schema {
                table: table.to_string(),
                source,
            })?;

        let mut summary = ImportSummary::default();
        for compare in store.list_valid_compares(ListOrder::Ascending) {
            match load_file(db, descriptor, &compare.path, batch_size).await {
                Ok(rows) => {
                    info!(file = %compare.path.display(), rows, "imported compare file");
                    summary.files += 1;
                    summary.rows += rows;
                }
                Err(err) => {
                    warn!(file = %compare.path.display(), error = %err, "import failed, skipping file");
                    summary.failed_files += 1;
                }
            }
        }
        Ok(summary)
    }
    .instrument(span)
    .await
}

async fn load_file(
    db: &dyn DeltaStore,
    descriptor: &EntityDescriptor,
    path: &Path,
    batch_size: usize,
) -> Result<u64, PipelineError> {
    let (tx, mut rx) = mpsc::channel::<Vec<DeltaRow>>(2);
    let reader = {
        let (path, entity) = (path.to_path_buf(), descriptor.entity);
        let batch_size = batch_size.max(1);
        tokio::task::spawn_blocking(move || read_batches(&path, entity, batch_size, tx))
    };

    let mut inserted = 0u64;
    let mut insert_error = None;
    while let Some(batch) = rx.recv().await {
        match db
            .insert_batch(&descriptor.table_name, descriptor.entity, &batch)
            .await
        {
            Ok(n) => inserted += n,
            Err(err) => {
                insert_error = Some(err);
                break;
            }
        }
    }
    drop(rx);

    let read = reader
        .await
        .map_err(|err| PipelineError::Other(anyhow!("import reader task failed: {err}")))?;
    if let Some(err) = insert_error {
        return Err(err.into());
    }
    read?;
    Ok(inserted)
}

fn read_batches(
    path: &Path,
    entity: EntityType,
    batch_size: usize,
    tx: mpsc::Sender<Vec<DeltaRow>>,
) -> Result<(), PipelineError> {
    let mut reader = open_gz_csv(path)?;
    let layout = RowLayout::new(reader.headers()?, entity, path)?;

    let mut batch = Vec::with_capacity(batch_size);
    for record in reader.records() {
        batch.push(layout.parse(&record?, entity)?);
        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if tx.blocking_send(full).is_err() {
                return Ok(());
            }
        }
    }
    if !batch.is_empty() {
        let _ = tx.blocking_send(batch);
    }
    Ok(())
}

/// Column positions of a compare file, looked up by header name.
struct RowLayout {
    timestamp: usize,
    id: usize,
    status: usize,
    attributes: Vec<Option<usize>>,
}

impl RowLayout {
    fn new(headers: &StringRecord, entity: EntityType, path: &Path) -> Result<Self, PipelineError> {
        let position = |name: &str| headers.iter().position(|h| h == name);
        let required = |name: &str| {
            position(name).ok_or_else(|| {
                PipelineError::Other(anyhow!("{} has no {name} column", path.display()))
            })
        };
        Ok(Self {
            timestamp: required(TIMESTAMP_COLUMN)?,
            id: required(ID_COLUMN)?,
            status: required(STATUS_COLUMN)?,
            attributes: entity
                .attribute_columns()
                .iter()
                .map(|column| position(column.name))
                .collect(),
        })
    }

    fn parse(&self, record: &StringRecord, entity: EntityType) -> Result<DeltaRow, PipelineError> {
        let field = |at: usize| record.get(at).unwrap_or_default();

        let raw_ts = field(self.timestamp);
        let timestamp = parse_timestamp(raw_ts)
            .map_err(|err| PipelineError::Other(anyhow!("bad timestamp {raw_ts:?}: {err}")))?;
        let raw_status = truncate_chars(field(self.status), STATUS_MAX_LEN);
        let status: RecordStatus = raw_status
            .parse()
            .map_err(|err| PipelineError::Other(anyhow!("{err}")))?;

        let attributes = entity
            .attribute_columns()
            .iter()
            .zip(&self.attributes)
            .map(|(column, at)| {
                at.and_then(|i| record.get(i))
                    .map(|value| truncate_chars(value, column.max_len).to_string())
            })
            .collect();

        Ok(DeltaRow {
            timestamp,
            id: truncate_chars(field(self.id), entity.id_max_len()).to_string(),
            status,
            attributes,
        })
    }
}
