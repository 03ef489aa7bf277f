//! Extraction and validation of the `Extension` metadata table.

use mlua::{Lua, Table, Value};

use crate::error::ExtensionError;
use crate::marshal::{bool_field, string_field};
use crate::source::Operation;
use crate::types::{ExtensionInfo, Filter, FilterOption};

/// Name of the global table every script must declare.
pub const METADATA_TABLE: &str = "Extension";

const DEFAULT_VERSION: &str = "1.0.0";

fn is_function(lua: &Lua, name: &str) -> bool {
    matches!(
        lua.globals().raw_get::<Value>(name),
        Ok(Value::Function(_))
    )
}

fn filters(table: &Table) -> Vec<Filter> {
    let Ok(Value::Table(list)) = table.raw_get::<Value>("filters") else {
        return Vec::new();
    };
    list.sequence_values::<Value>()
        .filter_map(|v| match v {
            Ok(Value::Table(t)) => Some(t),
            _ => None,
        })
        .map(|t| {
            let options = match t.raw_get::<Value>("options") {
                Ok(Value::Table(options)) => options
                    .sequence_values::<Value>()
                    .filter_map(|v| match v {
                        Ok(Value::Table(o)) => Some(FilterOption {
                            label: string_field(&o, "label"),
                            value: string_field(&o, "value"),
                        }),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            Filter {
                name: string_field(&t, "name"),
                kind: string_field(&t, "type"),
                key: string_field(&t, "key"),
                options,
            }
        })
        .collect()
}

fn min_app_version(
    table: &Table,
    app_version: &semver::Version,
) -> Result<Option<String>, ExtensionError> {
    let raw = match table.raw_get::<Value>("minAppVersion") {
        Ok(Value::Nil) | Err(_) => return Ok(None),
        Ok(Value::String(s)) => s.to_string_lossy().to_string(),
        Ok(other) => {
            return Err(ExtensionError::InvalidMetadata {
                field: "minAppVersion",
                reason: format!("expected string, got {}", other.type_name()),
            })
        }
    };
    let required = semver::Version::parse(raw.trim()).map_err(|e| {
        ExtensionError::InvalidMetadata {
            field: "minAppVersion",
            reason: format!("'{raw}' is not a semantic version: {e}"),
        }
    })?;
    if required > *app_version {
        return Err(ExtensionError::InvalidMetadata {
            field: "minAppVersion",
            reason: format!("requires app version {required}, host is {app_version}"),
        });
    }
    Ok(Some(raw))
}

/// Read `Extension` from an executed script and probe its entry points.
pub(crate) fn extract(
    lua: &Lua,
    app_version: &semver::Version,
) -> Result<ExtensionInfo, ExtensionError> {
    let table = match lua.globals().raw_get::<Value>(METADATA_TABLE) {
        Ok(Value::Table(t)) => t,
        Ok(Value::Nil) | Err(_) => return Err(ExtensionError::MissingMetadata(METADATA_TABLE)),
        Ok(other) => {
            return Err(ExtensionError::InvalidMetadata {
                field: METADATA_TABLE,
                reason: format!("expected table, got {}", other.type_name()),
            })
        }
    };

    let id = match table.raw_get::<Value>("id") {
        Ok(Value::String(s)) => s.to_string_lossy().trim().to_string(),
        Ok(Value::Nil) | Err(_) => String::new(),
        Ok(other) => {
            return Err(ExtensionError::InvalidMetadata {
                field: "id",
                reason: format!("expected string, got {}", other.type_name()),
            })
        }
    };
    if id.is_empty() {
        return Err(ExtensionError::MissingMetadata("id"));
    }

    let mut name = string_field(&table, "name");
    if name.is_empty() {
        name = id.clone();
    }
    let mut version = string_field(&table, "version");
    if version.is_empty() {
        version = DEFAULT_VERSION.to_string();
    }

    Ok(ExtensionInfo {
        min_app_version: min_app_version(&table, app_version)?,
        language: string_field(&table, "language"),
        base_url: string_field(&table, "baseUrl"),
        icon_url: string_field(&table, "iconUrl"),
        author: string_field(&table, "author"),
        nsfw: bool_field(&table, "nsfw"),
        has_search: is_function(lua, Operation::Search.entry_point()),
        has_latest: is_function(lua, Operation::GetLatest.entry_point()),
        has_popular: is_function(lua, Operation::GetPopular.entry_point()),
        filters: filters(&table),
        id,
        name,
        version,
    })
}
