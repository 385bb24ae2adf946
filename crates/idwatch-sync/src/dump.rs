//! Dump: materialize today's snapshot of one entity type.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use idwatch_adapters::{advance_cursor, SearchApi, INITIAL_CURSOR};
use idwatch_core::{EntityDescriptor, EntityRecord, EntityType};
use idwatch_storage::{create_gz_csv, finish_gz_csv, SnapshotStore};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::PipelineError;

/// Pages buffered between the fetch loop and the writer.
const PAGE_QUEUE: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpOutcome {
    pub path: PathBuf,
    pub processed: u64,
    pub total: u64,
    pub completed_at: DateTime<Utc>,
}

/// Fetches the full listing into `{date}.csv.gz` and seals it with a sentinel.
///
/// The companion only appears under its final name once every page has been
/// written, the count matches the API total, and the file is synced. Any
/// failure removes the staged output.
pub async fn run_dump(
    api: &dyn SearchApi,
    store: &SnapshotStore,
    descriptor: &EntityDescriptor,
    run_id: Uuid,
    today: NaiveDate,
) -> Result<DumpOutcome, PipelineError> {
    descriptor.validate()?;
    let span = info_span!("dump", entity = %descriptor.entity, %run_id);
    async move {
        store.ensure_root()?;
        store.purge_invalid();

        let target = store.dump_path(today);
        if target.exists() {
            return Err(PipelineError::DumpExists { path: target });
        }

        let _marker = store.begin_dump()?;
        let staging = store.staging_path();
        match fetch_into(api, descriptor, run_id, &staging).await {
            Ok((processed, total)) => {
                let completed_at = Utc::now();
                store.commit_staged(&staging, &target)?;
                if let Err(err) = store.write_sentinel(&target, completed_at) {
                    store.remove_artifact_file(&target);
                    return Err(err.into());
                }
                info!(file = %target.display(), processed, total, "dump complete");
                Ok(DumpOutcome {
                    path: target,
                    processed,
                    total,
                    completed_at,
                })
            }
            Err(err) => {
                warn!(file = %target.display(), error = %err, "dump failed, discarding output");
                store.remove_artifact_file(&staging);
                Err(err)
            }
        }
    }
    .instrument(span)
    .await
}

/// Streams every page into `staging`. Returns `(processed, total)`.
async fn fetch_into(
    api: &dyn SearchApi,
    descriptor: &EntityDescriptor,
    run_id: Uuid,
    staging: &Path,
) -> Result<(u64, u64), PipelineError> {
    let (tx, rx) = mpsc::channel::<Vec<EntityRecord>>(PAGE_QUEUE);
    let entity = descriptor.entity;
    let path = staging.to_path_buf();
    let writer = tokio::task::spawn_blocking(move || write_snapshot(&path, entity, rx));

    let fetched = fetch_pages(api, descriptor, run_id, tx).await;
    let written = writer
        .await
        .map_err(|err| PipelineError::Other(anyhow::anyhow!("snapshot writer task failed: {err}")))?;

    let (processed, total) = match (fetched, written) {
        // The writer's own error explains why it stopped listening.
        (Err(PipelineError::WriterClosed), Err(err)) => return Err(err),
        (Err(err), _) => return Err(err),
        (Ok(_), Err(err)) => return Err(err),
        (Ok((_, total)), Ok(written)) => (written, total),
    };

    if processed < total {
        return Err(PipelineError::IncompleteFetch { processed, total });
    }
    Ok((processed, total))
}

async fn fetch_pages(
    api: &dyn SearchApi,
    descriptor: &EntityDescriptor,
    run_id: Uuid,
    tx: mpsc::Sender<Vec<EntityRecord>>,
) -> Result<(u64, u64), PipelineError> {
    let mut cursor = INITIAL_CURSOR.to_string();
    let mut processed = 0u64;
    let mut expected: Option<u64> = None;

    loop {
        let page = api.fetch_page(run_id, descriptor, &cursor).await?;
        // The first page's count is the target; later pages may drift.
        let total = *expected.get_or_insert(page.total);
        processed += page.records.len() as u64;
        info!(processed, total, "fetched page");

        let next = advance_cursor(&cursor, page.next_cursor.as_deref());
        if !page.records.is_empty() && tx.send(page.records).await.is_err() {
            return Err(PipelineError::WriterClosed);
        }
        match next {
            Some(next) => cursor = next,
            None => break,
        }
    }
    Ok((processed, expected.unwrap_or_default()))
}

fn write_snapshot(
    path: &Path,
    entity: EntityType,
    mut rx: mpsc::Receiver<Vec<EntityRecord>>,
) -> Result<u64, PipelineError> {
    let mut writer = create_gz_csv(path)?;
    writer.write_record(entity.snapshot_header())?;

    let mut last_id: Option<String> = None;
    let mut written = 0u64;
    while let Some(page) = rx.blocking_recv() {
        for record in page {
            if let Some(previous) = &last_id {
                if record.id() < previous.as_str() {
                    return Err(PipelineError::UnsortedSnapshot {
                        previous: previous.clone(),
                        current: record.id().to_string(),
                    });
                }
            }
            writer.write_record(record.fields())?;
            last_id = Some(record.id().to_string());
            written += 1;
        }
    }
    finish_gz_csv(writer)?;
    Ok(written)
}
