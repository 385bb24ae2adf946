//! Snapshot files, the relational delta store and the rate-limited HTTP client.

pub mod database;
pub mod http;
pub mod snapshots;

pub use database::{
    schema_statements, DeltaRow, DeltaStore, MemoryDeltaStore, MissingRecord, PgDeltaStore,
};
pub use http::{
    is_transient_error, is_transient_status, oauth_header_value, BackoffPolicy, FetchError,
    FetchedBody, HttpClientConfig, HttpFetcher,
};
pub use snapshots::{
    compare_file_name, create_gz_csv, dump_file_name, finish_gz_csv, open_gz_csv,
    sentinel_path_for, CompareFile, DumpFile, DumpMarker, GzCsvReader, GzCsvWriter, ListOrder,
    SnapshotStore,
};

pub const CRATE_NAME: &str = "idwatch-storage";
