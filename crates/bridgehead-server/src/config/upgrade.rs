//! Configuration upgrades.
//!
//! An upgrade starts from the backend's example configuration and copies the
//! user's values on top, so keys added in newer versions appear with their
//! example defaults and the user's settings survive. Extra upgraders can then
//! rewrite or inject values.
//!
//! The output keeps the example's layout and comments. Keys the example does
//! not know keep the user's formatting.

use std::path::Path;

use toml::{Table, Value};
use toml_edit::{DocumentMut, Item, TableLike};
use tracing::{debug, warn};

use crate::ConfigError;

/// View of an upgrade in progress.
pub struct Helper<'a> {
    output: DocumentMut,
    user: &'a Table,
}

impl<'a> Helper<'a> {
    /// Upgrade of `user` starting from `output`.
    pub fn new(output: DocumentMut, user: &'a Table) -> Self {
        Self { output, user }
    }

    /// Value at `path` in the user's document.
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        lookup(self.user, path)
    }

    /// Set `path` in the output, creating intermediate tables.
    pub fn set(&mut self, path: &[&str], value: impl Into<toml_edit::Value>) {
        set_path(self.output.as_table_mut(), path, Item::Value(value.into()));
    }

    /// Copy `path` from the user's document to the output, if present.
    pub fn copy(&mut self, path: &[&str]) {
        let Some(item) = self.get(path).and_then(to_item) else {
            return;
        };
        set_path(self.output.as_table_mut(), path, item);
    }

    /// Current output.
    pub fn output(&self) -> &DocumentMut {
        &self.output
    }
}

/// One upgrade step.
pub trait Upgrader {
    /// Rewrite the output.
    fn upgrade(&self, helper: &mut Helper<'_>);
}

impl<F: Fn(&mut Helper<'_>)> Upgrader for F {
    fn upgrade(&self, helper: &mut Helper<'_>) {
        self(helper);
    }
}

/// Deep-overlay `top` onto `base`.
///
/// Tables merge key by key. Any other value in `top` replaces the value in
/// `base`, including when the two have different types: a scalar in `top`
/// replaces a whole table in `base` and the other way round. Comments above
/// a replaced key and after a replaced value stay as they were in `base`.
pub fn overlay(base: &mut dyn TableLike, top: &dyn TableLike) {
    for (key, item) in top.iter() {
        let both_tables = item.is_table_like() && base.get(key).is_some_and(Item::is_table_like);
        if both_tables {
            if let (Some(base_table), Some(top_table)) =
                (base.get_mut(key).and_then(Item::as_table_like_mut), item.as_table_like())
            {
                overlay(base_table, top_table);
            }
        } else if let Some(slot) = base.get_mut(key) {
            replace(slot, item.clone());
        } else if let Some((formatted, _)) = top.get_key_value(key) {
            base.entry_format(formatted).or_insert(item.clone());
        }
    }
}

fn replace(slot: &mut Item, mut item: Item) {
    if let (Item::Value(old), Item::Value(new)) = (&*slot, &mut item) {
        *new.decor_mut() = old.decor().clone();
    }
    *slot = item;
}

fn set_path(table: &mut dyn TableLike, path: &[&str], item: Item) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        match table.get_mut(first) {
            Some(slot) => replace(slot, item),
            None => {
                table.insert(first, item);
            },
        }
        return;
    }
    let entry = table.entry(first).or_insert_with(|| Item::Table(toml_edit::Table::new()));
    if !entry.is_table_like() {
        *entry = Item::Table(toml_edit::Table::new());
    }
    if let Some(next) = entry.as_table_like_mut() {
        set_path(next, rest, item);
    }
}

fn to_item(value: &Value) -> Option<Item> {
    match value {
        Value::Table(table) => {
            let mut out = toml_edit::Table::new();
            for (key, value) in table {
                out.insert(key, to_item(value)?);
            }
            Some(Item::Table(out))
        },
        other => other.to_string().parse::<toml_edit::Value>().ok().map(Item::Value),
    }
}

fn lookup<'a>(table: &'a Table, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let value = table.get(*first)?;
    if rest.is_empty() {
        return Some(value);
    }
    lookup(value.as_table()?, rest)
}

/// Result of [`do_upgrade`].
#[derive(Debug)]
pub struct UpgradeOutcome {
    /// Upgraded document, or the raw file when `upgraded` is false.
    pub data: String,
    /// True if `data` is the upgraded document.
    pub upgraded: bool,
    /// Non-fatal problem (unparseable input, failed save).
    pub warning: Option<ConfigError>,
}

fn parse_both(raw: &str, example: &str) -> Result<(Table, DocumentMut, DocumentMut), String> {
    let values = raw.parse::<Table>().map_err(|e| e.to_string())?;
    let user = raw.parse::<DocumentMut>().map_err(|e| e.to_string())?;
    let example = example.parse::<DocumentMut>().map_err(|e| format!("example config: {e}"))?;
    Ok((values, user, example))
}

/// Upgrade the configuration file at `path` against `example`.
///
/// Only a read failure is an error. A document that does not parse comes
/// back raw with `upgraded = false`; a failed save comes back upgraded with
/// a warning.
pub fn do_upgrade(
    path: &Path,
    save: bool,
    example: &str,
    upgraders: &[&dyn Upgrader],
) -> Result<UpgradeOutcome, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;

    let (values, user, mut output) = match parse_both(&raw, example) {
        Ok(parsed) => parsed,
        Err(e) => {
            return Ok(UpgradeOutcome {
                data: raw,
                upgraded: false,
                warning: Some(ConfigError::Parse(e)),
            });
        },
    };

    overlay(output.as_table_mut(), user.as_table());
    let mut helper = Helper::new(output, &values);
    for upgrader in upgraders {
        upgrader.upgrade(&mut helper);
    }
    let data = helper.output.to_string();

    let mut warning = None;
    if save && data != raw {
        match std::fs::write(path, &data) {
            Ok(()) => debug!(path = %path.display(), "saved upgraded config"),
            Err(source) => {
                warn!(path = %path.display(), %source, "failed to save upgraded config");
                warning = Some(ConfigError::Io { path: path.to_path_buf(), source });
            },
        }
    }

    Ok(UpgradeOutcome { data, upgraded: true, warning })
}

/// Merge `example` and then `actual`, used when upgrading did not produce a
/// usable document.
pub fn merge_fallback(example: &str, actual: &str) -> Result<Table, ConfigError> {
    let mut base = example
        .parse::<DocumentMut>()
        .map_err(|e| ConfigError::Parse(format!("example config: {e}")))?;
    let top = actual.parse::<DocumentMut>().map_err(|e| ConfigError::Parse(e.to_string()))?;
    overlay(base.as_table_mut(), top.as_table());
    base.to_string().parse::<Table>().map_err(|e| ConfigError::Parse(e.to_string()))
}
