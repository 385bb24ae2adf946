#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use idwatch_adapters::{ApiError, SearchApi, SearchPage, INITIAL_CURSOR};
use idwatch_core::{EntityDescriptor, EntityRecord, EntityType};
use idwatch_storage::{create_gz_csv, finish_gz_csv, open_gz_csv, SnapshotStore};
use uuid::Uuid;

/// In-process stand-in for the search API.
#[derive(Default)]
pub struct FakeApi {
    pub ids: HashMap<EntityType, Vec<String>>,
    pub page_size: usize,
    /// Overrides `numFound` for every page.
    pub reported_total: Option<u64>,
    /// Overrides `numFound` for the first page only.
    pub first_page_total: Option<u64>,
    /// Number of upcoming `fetch_page` calls that fail.
    pub failing_fetches: AtomicUsize,
    pub broken_entities: HashSet<EntityType>,
    pub live_ids: HashSet<String>,
    pub erroring_ids: HashSet<String>,
    pub verify_delay: Duration,
    pub fetch_calls: AtomicUsize,
    pub verify_started: AtomicUsize,
    pub verify_completed: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeApi {
    pub fn with_ids(entity: EntityType, ids: &[&str]) -> Self {
        let mut api = Self {
            page_size: 2,
            ..Default::default()
        };
        api.ids.insert(entity, ids.iter().map(|id| id.to_string()).collect());
        api
    }

    fn decode_error() -> ApiError {
        let source = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        ApiError::Decode {
            url: "fake://search".to_string(),
            source,
        }
    }
}

#[async_trait]
impl SearchApi for FakeApi {
    async fn fetch_page(
        &self,
        _run_id: Uuid,
        descriptor: &EntityDescriptor,
        cursor: &str,
    ) -> Result<SearchPage, ApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.broken_entities.contains(&descriptor.entity) {
            return Err(Self::decode_error());
        }
        let pending_failure = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if pending_failure {
            return Err(Self::decode_error());
        }

        let ids = self.ids.get(&descriptor.entity).cloned().unwrap_or_default();
        let offset: usize = if cursor == INITIAL_CURSOR {
            0
        } else {
            cursor.trim_start_matches('c').parse().unwrap()
        };
        let end = (offset + self.page_size.max(1)).min(ids.len());
        let records = ids[offset.min(ids.len())..end]
            .iter()
            .map(|id| {
                EntityRecord::from_json(descriptor.entity, serde_json::json!({ "id": id })).unwrap()
            })
            .collect();
        let next_cursor = if end < ids.len() {
            format!("c{end}")
        } else {
            cursor.to_string()
        };

        let first_page = cursor == INITIAL_CURSOR;
        let total = match self.first_page_total {
            Some(total) if first_page => total,
            _ => self.reported_total.unwrap_or(ids.len() as u64),
        };
        Ok(SearchPage {
            total,
            next_cursor: Some(next_cursor),
            records,
        })
    }

    async fn record_exists(&self, _run_id: Uuid, _entity: EntityType, id: &str) -> Result<bool, ApiError> {
        self.verify_started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.verify_delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.verify_completed.fetch_add(1, Ordering::SeqCst);
        if self.erroring_ids.contains(id) {
            return Err(Self::decode_error());
        }
        Ok(self.live_ids.contains(id))
    }
}

pub fn date(text: &str) -> NaiveDate {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").unwrap()
}

pub fn at(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
}

/// Writes a sealed dump with the entity's header and one row per id.
pub fn write_dump(store: &SnapshotStore, entity: EntityType, day: &str, ids: &[&str], sealed_at: &str) {
    store.ensure_root().unwrap();
    let path = store.dump_path(date(day));
    let header = entity.snapshot_header();
    let mut writer = create_gz_csv(&path).unwrap();
    writer.write_record(&header).unwrap();
    for id in ids {
        let mut row = vec![id.to_string()];
        row.extend(header[1..].iter().map(|column| format!("{column}-{id}")));
        writer.write_record(&row).unwrap();
    }
    finish_gz_csv(writer).unwrap();
    store.write_sentinel(&path, at(sealed_at)).unwrap();
}

pub fn read_ids(path: &Path, id_column: usize) -> Vec<String> {
    let mut reader = open_gz_csv(path).unwrap();
    reader
        .records()
        .map(|row| row.unwrap().get(id_column).unwrap().to_string())
        .collect()
}

/// Every companion has a sentinel, every sentinel has a companion, no staging files remain.
pub fn assert_sentinel_invariant(dir: &Path) {
    let names: HashSet<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => return,
    };
    for name in &names {
        if let Some(base) = name.strip_suffix(".csv.gz") {
            assert!(names.contains(&format!("{base}.txt")), "{name} has no sentinel");
        }
        if let Some(base) = name.strip_suffix(".txt") {
            assert!(names.contains(&format!("{base}.csv.gz")), "{name} has no companion");
        }
        assert!(!name.ends_with(".tmp"), "staging file {name} left behind");
    }
}
