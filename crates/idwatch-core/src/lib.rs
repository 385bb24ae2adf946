//! Core entity model, column schemas and record codecs for idwatch.

mod diff;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use diff::{streaming_set_difference, SetDifference, SortOrderViolation, StreamSide};

pub const CRATE_NAME: &str = "idwatch-core";

/// Format of sentinel contents and of the injected `timestamp` column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

pub const ID_COLUMN: &str = "id";
pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const STATUS_COLUMN: &str = "status";
pub const STATUS_MAX_LEN: usize = 16;

/// One column of an entity schema with its destination `VARCHAR(n)` bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub max_len: usize,
}

const fn column(name: &'static str, max_len: usize) -> Column {
    Column { name, max_len }
}

const ITEM_COLUMNS: &[Column] = &[
    column("id", 32),
    column("provider_item_id", 512),
    column("dataset_id", 128),
    column("label", 1024),
    column("provider_id", 256),
    column("sector_fct", 16),
    column("supplier_id", 128),
];

const AUTHORITY_COLUMNS: &[Column] = &[
    column("id", 64),
    column("variant_id", 256),
    column("preferredName", 1024),
    column("type", 32),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Item,
    Person,
    Organization,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Item, EntityType::Person, EntityType::Organization];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Item => "item",
            EntityType::Person => "person",
            EntityType::Organization => "organization",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EntityType::Item => "ITEM",
            EntityType::Person => "PERSON",
            EntityType::Organization => "ORGANIZATION",
        }
    }

    /// Search index the entity lives in on the remote API.
    pub fn index_segment(self) -> &'static str {
        match self {
            EntityType::Item => "search",
            EntityType::Person => "person",
            EntityType::Organization => "organization",
        }
    }

    /// Snapshot column order. `id` is always first.
    pub fn columns(self) -> &'static [Column] {
        match self {
            EntityType::Item => ITEM_COLUMNS,
            EntityType::Person | EntityType::Organization => AUTHORITY_COLUMNS,
        }
    }

    pub fn attribute_columns(self) -> &'static [Column] {
        &self.columns()[1..]
    }

    pub fn id_max_len(self) -> usize {
        self.columns()[0].max_len
    }

    pub fn snapshot_header(self) -> Vec<&'static str> {
        self.columns().iter().map(|c| c.name).collect()
    }

    /// Header of compare files: injected columns around `id`, then attributes.
    pub fn delta_header(self) -> Vec<&'static str> {
        let mut header = vec![TIMESTAMP_COLUMN, ID_COLUMN, STATUS_COLUMN];
        header.extend(self.attribute_columns().iter().map(|c| c.name));
        header
    }

    pub fn default_query(self, page_size: usize) -> String {
        let fields = self.snapshot_header().join(",");
        format!(
            "/search/index/{}/select?q=*:*&wt=json&fl={}&sort=id ASC&rows={}",
            self.index_segment(),
            fields,
            page_size.max(1)
        )
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity type: {0}")]
pub struct UnknownEntityType(pub String);

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "item" | "items" => Ok(EntityType::Item),
            "person" | "persons" => Ok(EntityType::Person),
            "organization" | "organizations" => Ok(EntityType::Organization),
            other => Err(UnknownEntityType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    New,
    Missing,
    Found,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::New => "NEW",
            RecordStatus::Missing => "MISSING",
            RecordStatus::Found => "FOUND",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown record status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for RecordStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "NEW" => Ok(RecordStatus::New),
            "MISSING" => Ok(RecordStatus::Missing),
            "FOUND" => Ok(RecordStatus::Found),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Accepts either a scalar or an array for multi-valued index fields.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(values)) => values.into_iter().filter_map(scalar_text).collect(),
        Some(other) => scalar_text(other).into_iter().collect(),
    })
}

fn scalar_text(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }
}

/// Multi-valued fields are written as `[a, b]`, matching the historical dump format.
fn render_many(values: &[String]) -> String {
    format!("[{}]", values.join(", "))
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemDoc {
    pub id: String,
    #[serde(default)]
    pub provider_item_id: Option<String>,
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub label: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub provider_id: Vec<String>,
    #[serde(default)]
    pub sector_fct: Option<String>,
    #[serde(default)]
    pub supplier_id: Option<String>,
}

/// Shape shared by person and organization authority records.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthorityDoc {
    pub id: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub variant_id: Vec<String>,
    #[serde(default, rename = "preferredName")]
    pub preferred_name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRecord {
    Item(ItemDoc),
    Person(AuthorityDoc),
    Organization(AuthorityDoc),
}

impl EntityRecord {
    pub fn from_json(entity: EntityType, value: JsonValue) -> Result<Self, serde_json::Error> {
        Ok(match entity {
            EntityType::Item => EntityRecord::Item(serde_json::from_value(value)?),
            EntityType::Person => EntityRecord::Person(serde_json::from_value(value)?),
            EntityType::Organization => EntityRecord::Organization(serde_json::from_value(value)?),
        })
    }

    pub fn entity(&self) -> EntityType {
        match self {
            EntityRecord::Item(_) => EntityType::Item,
            EntityRecord::Person(_) => EntityType::Person,
            EntityRecord::Organization(_) => EntityType::Organization,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            EntityRecord::Item(doc) => &doc.id,
            EntityRecord::Person(doc) | EntityRecord::Organization(doc) => &doc.id,
        }
    }

    /// Values in [`EntityType::columns`] order.
    pub fn fields(&self) -> Vec<String> {
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        match self {
            EntityRecord::Item(doc) => vec![
                doc.id.clone(),
                text(&doc.provider_item_id),
                text(&doc.dataset_id),
                render_many(&doc.label),
                render_many(&doc.provider_id),
                text(&doc.sector_fct),
                text(&doc.supplier_id),
            ],
            EntityRecord::Person(doc) | EntityRecord::Organization(doc) => vec![
                doc.id.clone(),
                render_many(&doc.variant_id),
                text(&doc.preferred_name),
                text(&doc.kind),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("query parameter not set for {0}")]
    MissingQuery(EntityType),
    #[error("data path not set for {0}")]
    MissingDataPath(EntityType),
    #[error("table name not set for {0}")]
    MissingTableName(EntityType),
    #[error("table name {table:?} for {entity} is not a plain SQL identifier")]
    InvalidTableName { entity: EntityType, table: String },
}

/// Everything the shared pipeline stages need to know about one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub entity: EntityType,
    pub query: String,
    pub data_path: PathBuf,
    pub table_name: String,
}

impl EntityDescriptor {
    pub fn with_defaults(entity: EntityType, data_root: &Path, page_size: usize) -> Self {
        Self {
            entity,
            query: entity.default_query(page_size),
            data_path: data_root.join(entity.as_str()),
            table_name: entity.as_str().to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.query.trim().is_empty() {
            return Err(DescriptorError::MissingQuery(self.entity));
        }
        if self.data_path.as_os_str().is_empty() {
            return Err(DescriptorError::MissingDataPath(self.entity));
        }
        if self.table_name.trim().is_empty() {
            return Err(DescriptorError::MissingTableName(self.entity));
        }
        if !is_sql_identifier(&self.table_name) {
            return Err(DescriptorError::InvalidTableName {
                entity: self.entity,
                table: self.table_name.clone(),
            });
        }
        Ok(())
    }
}

pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let text = text.trim();
    DateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .map(|dt| dt.with_timezone(&Utc))
}

/// Clips `value` to at most `max_chars` characters.
pub fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &value[..byte_idx],
        None => value,
    }
}
