//! Conversion between Lua values and contract records.
//!
//! Guest tables are read field by field with raw access. A missing or
//! wrong-typed field takes its zero value; numbers are accepted in string
//! fields and numeric strings in number fields. Only a wrong top-level
//! shape is an error.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use mlua::{Lua, MultiValue, Table, Value};

use crate::error::ExtensionError;
use crate::types::{
    AnimeDetails, AnimeEntry, AnimePage, Episode, SearchFilters, Subtitle, VideoSource,
};

// ─── Field readers ──────────────────────────────────────────────────────

fn field(table: &Table, key: &str) -> Value {
    table.raw_get::<Value>(key).unwrap_or(Value::Nil)
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_string_lossy().to_string()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) => Some(format_number(*n)),
        _ => None,
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Number(n) => Some(*n),
        Value::String(s) => s.to_string_lossy().trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn string_field(table: &Table, key: &str) -> String {
    value_to_string(&field(table, key)).unwrap_or_default()
}

pub(crate) fn int_field(table: &Table, key: &str) -> i64 {
    match field(table, key) {
        Value::Integer(i) => i,
        other => value_to_f64(&other)
            .filter(|n| n.is_finite())
            .map(|n| n as i64)
            .unwrap_or_default(),
    }
}

pub(crate) fn float_field(table: &Table, key: &str) -> f64 {
    value_to_f64(&field(table, key))
        .filter(|n| n.is_finite())
        .unwrap_or_default()
}

pub(crate) fn bool_field(table: &Table, key: &str) -> bool {
    matches!(field(table, key), Value::Boolean(true))
}

/// Sequence of string-like values; anything else is skipped.
pub(crate) fn string_list(table: &Table, key: &str) -> Vec<String> {
    match field(table, key) {
        Value::Table(list) => list
            .sequence_values::<Value>()
            .filter_map(|v| v.ok())
            .filter_map(|v| value_to_string(&v))
            .collect(),
        _ => Vec::new(),
    }
}

fn string_map(table: &Table, key: &str) -> HashMap<String, String> {
    match field(table, key) {
        Value::Table(map) => map
            .pairs::<Value, Value>()
            .filter_map(|pair| pair.ok())
            .filter_map(|(k, v)| Some((value_to_string(&k)?, value_to_string(&v)?)))
            .collect(),
        _ => HashMap::new(),
    }
}

/// Tables in a sequence; non-table items are skipped.
fn table_items(list: &Table) -> Vec<Table> {
    list.sequence_values::<Value>()
        .filter_map(|v| match v {
            Ok(Value::Table(t)) => Some(t),
            _ => None,
        })
        .collect()
}

fn expect_list(value: Value, what: &str) -> Result<Vec<Table>, ExtensionError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Table(list) => Ok(table_items(&list)),
        other => Err(ExtensionError::Runtime(format!(
            "expected a table of {what}, got {}",
            other.type_name()
        ))),
    }
}

/// RFC 3339 timestamp or a bare `YYYY-MM-DD` date at midnight UTC.
pub(crate) fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

// ─── Records ────────────────────────────────────────────────────────────

pub(crate) fn anime_entry(t: &Table) -> AnimeEntry {
    AnimeEntry {
        title: string_field(t, "title"),
        url: string_field(t, "url"),
        image: string_field(t, "image"),
        description: string_field(t, "description"),
        status: string_field(t, "status"),
    }
}

pub(crate) fn anime_details(t: &Table) -> AnimeDetails {
    AnimeDetails {
        title: string_field(t, "title"),
        alternate_title: string_field(t, "alternateTitle"),
        url: string_field(t, "url"),
        image: string_field(t, "image"),
        banner: string_field(t, "banner"),
        description: string_field(t, "description"),
        status: string_field(t, "status"),
        genres: string_list(t, "genres"),
        year: int_field(t, "year"),
        studio: string_field(t, "studio"),
        rating: float_field(t, "rating"),
        total_episodes: int_field(t, "totalEpisodes"),
    }
}

pub(crate) fn episode(t: &Table) -> Episode {
    Episode {
        number: int_field(t, "number"),
        title: string_field(t, "title"),
        url: string_field(t, "url"),
        thumbnail: string_field(t, "thumbnail"),
        date: parse_date(&string_field(t, "date")),
        filler: bool_field(t, "filler"),
    }
}

pub(crate) fn subtitle(t: &Table) -> Subtitle {
    Subtitle {
        url: string_field(t, "url"),
        language: string_field(t, "language"),
        label: string_field(t, "label"),
        format: string_field(t, "format"),
        default: bool_field(t, "default"),
    }
}

pub(crate) fn video_source(t: &Table) -> VideoSource {
    let subtitles = match field(t, "subtitles") {
        Value::Table(list) => table_items(&list).iter().map(subtitle).collect(),
        _ => Vec::new(),
    };
    VideoSource {
        url: string_field(t, "url"),
        quality: string_field(t, "quality"),
        format: string_field(t, "format"),
        server: string_field(t, "server"),
        headers: string_map(t, "headers"),
        subtitles,
    }
}

// ─── Call results ───────────────────────────────────────────────────────

/// `entries, hasNextPage` as returned by the listing entry points.
pub(crate) fn anime_page(values: MultiValue) -> Result<AnimePage, ExtensionError> {
    let mut values = values.into_iter();
    let entries = values.next().unwrap_or(Value::Nil);
    let has_next_page = values
        .next()
        .is_some_and(|v| !matches!(v, Value::Nil | Value::Boolean(false)));
    let entries = expect_list(entries, "anime entries")?
        .iter()
        .map(anime_entry)
        .collect();
    Ok(AnimePage {
        entries,
        has_next_page,
    })
}

pub(crate) fn anime_details_result(value: Value) -> Result<Option<AnimeDetails>, ExtensionError> {
    match value {
        Value::Nil => Ok(None),
        Value::Table(t) => Ok(Some(anime_details(&t))),
        other => Err(ExtensionError::Runtime(format!(
            "expected anime details table, got {}",
            other.type_name()
        ))),
    }
}

pub(crate) fn episodes_result(value: Value) -> Result<Vec<Episode>, ExtensionError> {
    Ok(expect_list(value, "episodes")?.iter().map(episode).collect())
}

pub(crate) fn video_sources_result(value: Value) -> Result<Vec<VideoSource>, ExtensionError> {
    Ok(expect_list(value, "video sources")?
        .iter()
        .map(video_source)
        .collect())
}

// ─── Host to guest ──────────────────────────────────────────────────────

pub(crate) fn filters_table(lua: &Lua, filters: &SearchFilters) -> mlua::Result<Table> {
    let table = lua.create_table_with_capacity(0, filters.0.len())?;
    for (key, value) in filters.iter() {
        table.raw_set(key.as_str(), value.as_str())?;
    }
    Ok(table)
}
