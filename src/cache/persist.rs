//! JSON file persistence for the credential cache.
//!
//! The file is a single object mapping cache key to
//! `{cookies, user_agent, created_at, expires_at}`. Entries are decoded one by
//! one so a single bad record never costs the rest of the cache.

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::{CacheKey, ClearanceRecord};

/// Persistence failure. Logged by the cache, never propagated to callers.
#[derive(Debug, Error)]
pub enum CacheIoError {
    #[error("failed to serialise cache: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write cache file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Serialize)]
struct StoredRecord<'a> {
    cookies: &'a BTreeMap<String, String>,
    user_agent: &'a str,
    created_at: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct LoadedRecord {
    cookies: BTreeMap<String, String>,
    user_agent: String,
    #[serde(alias = "timestamp")]
    created_at: String,
    expires_at: String,
}

#[derive(Debug, Error)]
enum EntryError {
    #[error("malformed entry: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("unparsable timestamp {0:?}")]
    Timestamp(String),
    #[error("expires_at is not after created_at")]
    Inverted,
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339, or a naive ISO-8601 timestamp interpreted as local time.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

fn decode_entry(value: Value) -> Result<ClearanceRecord, EntryError> {
    let loaded: LoadedRecord = serde_json::from_value(value)?;
    let created_at = parse_timestamp(&loaded.created_at)
        .ok_or_else(|| EntryError::Timestamp(loaded.created_at.clone()))?;
    let expires_at = parse_timestamp(&loaded.expires_at)
        .ok_or_else(|| EntryError::Timestamp(loaded.expires_at.clone()))?;
    if expires_at <= created_at {
        return Err(EntryError::Inverted);
    }

    Ok(ClearanceRecord {
        cookies: loaded.cookies,
        user_agent: loaded.user_agent,
        created_at,
        expires_at,
    })
}

pub(super) fn load(path: &Path) -> HashMap<CacheKey, ClearanceRecord> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return HashMap::new(),
        Err(err) => {
            log::warn!("failed to read cache file {}: {err}", path.display());
            return HashMap::new();
        }
    };

    let entries: Map<String, Value> = match serde_json::from_str(&contents) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("failed to parse cache file {}: {err}", path.display());
            return HashMap::new();
        }
    };

    let mut records = HashMap::with_capacity(entries.len());
    for (key, value) in entries {
        match decode_entry(value) {
            Ok(record) => {
                records.insert(CacheKey::from_persisted(key), record);
            }
            Err(err) => log::warn!("skipping cached entry {key}: {err}"),
        }
    }
    records
}

pub(super) fn save(
    path: &Path,
    records: &HashMap<CacheKey, ClearanceRecord>,
) -> Result<(), CacheIoError> {
    let ordered: BTreeMap<&str, StoredRecord<'_>> = records
        .iter()
        .map(|(key, record)| {
            (
                key.as_str(),
                StoredRecord {
                    cookies: &record.cookies,
                    user_agent: &record.user_agent,
                    created_at: format_timestamp(&record.created_at),
                    expires_at: format_timestamp(&record.expires_at),
                },
            )
        })
        .collect();
    let payload = serde_json::to_vec_pretty(&ordered)?;

    let tmp = path.with_extension("json.tmp");
    let write_err = |source| CacheIoError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut file = fs::File::create(&tmp).map_err(write_err)?;
    file.write_all(&payload).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)?;
    Ok(())
}
