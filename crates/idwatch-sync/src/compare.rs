//! Compare: directional deltas between adjacent snapshots.

use std::path::Path;

use anyhow::anyhow;
use chrono::Utc;
use csv::StringRecord;
use idwatch_core::{
    format_timestamp, streaming_set_difference, EntityType, RecordStatus, ID_COLUMN,
};
use idwatch_storage::{
    create_gz_csv, finish_gz_csv, open_gz_csv, DumpFile, ListOrder, SnapshotStore,
};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::PipelineError;

const FLUSH_EVERY: u64 = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompareSummary {
    pub pairs: usize,
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Produces MISSING and NEW deltas for every adjacent pair of valid dumps.
///
/// A failed pair is logged and its partial output removed; the remaining
/// pairs are still processed.
pub async fn run_compare(
    store: &SnapshotStore,
    entity: EntityType,
) -> Result<CompareSummary, PipelineError> {
    let span = info_span!("compare", %entity);
    async move {
        let dumps = store.list_valid_dumps(ListOrder::Ascending);
        let mut summary = CompareSummary::default();

        for pair in dumps.windows(2) {
            let (older, newer) = (&pair[0], &pair[1]);
            summary.pairs += 1;

            for (status, from, subtract) in [
                (RecordStatus::Missing, older, newer),
                (RecordStatus::New, newer, older),
            ] {
                let target = store.compare_path(older.date, newer.date, status);
                if store.is_complete(&target) {
                    summary.skipped += 1;
                    continue;
                }

                match diff_pair(store, entity, older, newer, from, subtract, status, &target).await {
                    Ok(rows) => {
                        info!(file = %target.display(), rows, %status, "compare file written");
                        summary.created += 1;
                    }
                    Err(err) => {
                        warn!(file = %target.display(), error = %err, "compare failed, skipping pair");
                        summary.failed += 1;
                    }
                }
            }
        }
        Ok(summary)
    }
    .instrument(span)
    .await
}

#[allow(clippy::too_many_arguments)]
async fn diff_pair(
    store: &SnapshotStore,
    entity: EntityType,
    older: &DumpFile,
    newer: &DumpFile,
    from: &DumpFile,
    subtract: &DumpFile,
    status: RecordStatus,
    target: &Path,
) -> Result<u64, PipelineError> {
    let stamped_at = store.read_sentinel(&older.path)?.max(store.read_sentinel(&newer.path)?);
    let timestamp = format_timestamp(stamped_at);
    let staging = store.staging_path();

    let task = {
        let (from, subtract, staging) = (from.path.clone(), subtract.path.clone(), staging.clone());
        tokio::task::spawn_blocking(move || {
            diff_files(entity, &from, &subtract, &staging, status, &timestamp)
        })
    };
    let result = match task.await {
        Ok(result) => result,
        Err(err) => Err(PipelineError::Other(anyhow!("compare task failed: {err}"))),
    };

    let finished = result.and_then(|rows| {
        store.commit_staged(&staging, target)?;
        store.write_sentinel(target, Utc::now())?;
        Ok(rows)
    });
    if finished.is_err() {
        store.remove_artifact_file(&staging);
        store.remove_artifact_file(target);
    }
    finished
}

fn id_position(headers: &StringRecord, path: &Path) -> Result<usize, PipelineError> {
    headers
        .iter()
        .position(|h| h == ID_COLUMN)
        .ok_or_else(|| PipelineError::Other(anyhow!("{} has no {ID_COLUMN} column", path.display())))
}

type KeyedRecords = Box<dyn Iterator<Item = Result<(String, StringRecord), PipelineError>>>;

fn keyed_records(path: &Path) -> Result<(StringRecord, KeyedRecords), PipelineError> {
    let mut reader = open_gz_csv(path)?;
    let headers = reader.headers()?.clone();
    let id_at = id_position(&headers, path)?;
    let records = reader.into_records().map(move |row| -> Result<_, PipelineError> {
        let row = row?;
        let id = row.get(id_at).unwrap_or_default().to_string();
        Ok((id, row))
    });
    Ok((headers, Box::new(records)))
}

/// Rows of `from` whose id is absent from `subtract`, stamped and labelled.
///
/// Both inputs are read in one forward pass; out-of-order ids fail the
/// comparison instead of producing a wrong delta.
pub fn diff_files(
    entity: EntityType,
    from: &Path,
    subtract: &Path,
    output: &Path,
    status: RecordStatus,
    timestamp: &str,
) -> Result<u64, PipelineError> {
    let (headers, left) = keyed_records(from)?;
    let (_, right) = keyed_records(subtract)?;

    // Older dumps may lack newer columns; those come out empty.
    let projection: Vec<Option<usize>> = entity
        .attribute_columns()
        .iter()
        .map(|column| headers.iter().position(|h| h == column.name))
        .collect();

    let mut writer = create_gz_csv(output)?;
    writer.write_record(entity.delta_header())?;

    let mut written = 0u64;
    for item in streaming_set_difference(left, right, |(id, _): &(String, StringRecord)| id.clone()) {
        let (id, row) = item?;
        let mut out = Vec::with_capacity(projection.len() + 3);
        out.push(timestamp);
        out.push(id.as_str());
        out.push(status.as_str());
        out.extend(
            projection
                .iter()
                .map(|at| at.and_then(|i| row.get(i)).unwrap_or_default()),
        );
        writer.write_record(&out)?;
        written += 1;
        if written % FLUSH_EVERY == 0 {
            writer.flush()?;
        }
    }
    finish_gz_csv(writer)?;
    Ok(written)
}
