//! Correct: re-verify MISSING records against the live index.

use futures::stream::{self, StreamExt};
use idwatch_adapters::SearchApi;
use idwatch_core::EntityDescriptor;
use idwatch_storage::DeltaStore;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::PipelineError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrectSummary {
    pub checked: usize,
    pub found: usize,
    pub failed: usize,
}

/// Checks every MISSING record and flips the ones that reappeared to FOUND.
///
/// At most `concurrency` checks are in flight; the function returns only
/// after every check has finished. A failed check leaves the record MISSING.
pub async fn run_correct(
    api: &dyn SearchApi,
    db: &dyn DeltaStore,
    descriptor: &EntityDescriptor,
    run_id: Uuid,
    concurrency: usize,
) -> Result<CorrectSummary, PipelineError> {
    descriptor.validate()?;
    let entity = descriptor.entity;
    let table = descriptor.table_name.as_str();
    let span = info_span!("correct", %entity, %run_id);

    async move {
        let missing = db.missing_records(table).await?;
        info!(records = missing.len(), "verifying missing records");

        let mut checks = stream::iter(missing)
            .map(|record| async move {
                let outcome = api.record_exists(run_id, entity, &record.id).await;
                (record, outcome)
            })
            .buffer_unordered(concurrency.max(1));

        let mut summary = CorrectSummary::default();
        while let Some((record, outcome)) = checks.next().await {
            summary.checked += 1;
            match outcome {
                Ok(true) => match db.mark_found(table, &record).await {
                    Ok(true) => {
                        debug!(id = record.id.as_str(), "record reappeared");
                        summary.found += 1;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(id = record.id.as_str(), error = %err, "could not mark record found");
                        summary.failed += 1;
                    }
                },
                Ok(false) => {}
                Err(err) => {
                    warn!(id = record.id.as_str(), error = %err, "verification failed, leaving MISSING");
                    summary.failed += 1;
                }
            }
        }

        info!(checked = summary.checked, found = summary.found, failed = summary.failed, "correct finished");
        Ok(summary)
    }
    .instrument(span)
    .await
}
