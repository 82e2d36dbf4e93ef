//! Shared bridge database.
//!
//! One redb file holds the bridge's own tables, the state store and the
//! crypto store. Each component declares its tables in a [`Schema`]; the
//! metadata table records who owns the file and which schema version each
//! component is at.
//!
//! All tables map `&str` keys to CBOR-encoded values.

mod error;

use std::{
    collections::BTreeSet,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use redb::{
    MultimapTableHandle, ReadableTable, TableDefinition, TableError, TableHandle,
    backends::InMemoryBackend,
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{info, warn};

pub use self::error::StorageError;

/// Path that selects the in-memory backend.
pub const MEMORY_PATH: &str = ":memory:";

/// Table: bridgehead_meta
/// Key: `owner` or `version:<component>`
/// Value: CBOR string (owner) or CBOR u32 (version)
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("bridgehead_meta");

const OWNER_KEY: &str = "owner";

/// Tables a component creates, grouped by the schema version that
/// introduced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    /// Component name recorded in the metadata table.
    pub component: &'static str,
    /// `versions[i]` lists the tables added by version `i + 1`.
    pub versions: &'static [&'static [&'static str]],
}

impl Schema {
    /// Latest version of this schema.
    pub fn latest(&self) -> u32 {
        self.versions.len() as u32
    }

    fn tables(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.versions.iter().flat_map(|tables| tables.iter().copied())
    }
}

/// Handle to the shared database.
///
/// Clone is cheap (Arc); clones share the file and the declared schemas.
#[derive(Clone)]
pub struct Database {
    db: Arc<redb::Database>,
    owner: String,
    ignore_unsupported_database: bool,
    ignore_foreign_tables: bool,
    known_tables: Arc<Mutex<BTreeSet<String>>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("owner", &self.owner).finish_non_exhaustive()
    }
}

impl Database {
    /// Open or create the database at `path`, or an in-memory database for
    /// [`MEMORY_PATH`].
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: &str, owner: impl Into<String>) -> Result<Self, StorageError> {
        let db = if path == MEMORY_PATH {
            redb::Database::builder().create_with_backend(InMemoryBackend::new())
        } else {
            redb::Database::create(Path::new(path))
        }
        .map_err(|e| StorageError::Io(e.to_string()))?;

        let known = BTreeSet::from([META.name().to_string()]);
        Ok(Self {
            db: Arc::new(db),
            owner: owner.into(),
            ignore_unsupported_database: false,
            ignore_foreign_tables: false,
            known_tables: Arc::new(Mutex::new(known)),
        })
    }

    /// Continue when a schema is newer than supported.
    #[must_use]
    pub fn with_ignore_unsupported_database(mut self, ignore: bool) -> Self {
        self.ignore_unsupported_database = ignore;
        self
    }

    /// Continue when the file contains tables no component declared.
    #[must_use]
    pub fn with_ignore_foreign_tables(mut self, ignore: bool) -> Self {
        self.ignore_foreign_tables = ignore;
        self
    }

    /// Owner name recorded in the file.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Register a schema's tables as ours without upgrading it yet.
    ///
    /// Every component must be declared before the first upgrade, otherwise
    /// its tables count as foreign.
    pub fn declare(&self, schema: &Schema) {
        let mut known = self.known_tables.lock().unwrap_or_else(PoisonError::into_inner);
        known.extend(schema.tables().map(str::to_string));
    }

    /// Bring `schema` to its latest version.
    ///
    /// Checks, in order: foreign tables, ownership, stored version. Then
    /// creates the tables of every missing version and records the version
    /// and owner.
    pub fn upgrade(&self, schema: &Schema) -> Result<(), StorageError> {
        self.declare(schema);

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        if !self.ignore_foreign_tables {
            let foreign = self.foreign_tables(&txn)?;
            if !foreign.is_empty() {
                return Err(StorageError::ForeignTables(foreign));
            }
        }

        {
            let mut meta = txn.open_table(META).map_err(|e| StorageError::Io(e.to_string()))?;

            let owner: Option<String> = read_value(&meta, OWNER_KEY)?;
            if let Some(owner) = owner {
                if owner != self.owner {
                    return Err(StorageError::NotOwned { owner, expected: self.owner.clone() });
                }
            }

            let version_key = format!("version:{}", schema.component);
            let current: u32 = read_value(&meta, &version_key)?.unwrap_or(0);
            let latest = schema.latest();

            if current > latest {
                if !self.ignore_unsupported_database {
                    return Err(StorageError::UnsupportedVersion {
                        component: schema.component.to_string(),
                        found: current,
                        latest,
                    });
                }
                warn!(
                    component = schema.component,
                    current, latest, "unsupported database schema version, continuing anyway"
                );
            }

            for (index, tables) in schema.versions.iter().enumerate().skip(current as usize) {
                for table in *tables {
                    let definition: TableDefinition<&str, &[u8]> = TableDefinition::new(table);
                    txn.open_table(definition).map_err(|e| StorageError::Io(e.to_string()))?;
                }
                let version = index + 1;
                info!(component = schema.component, version, "upgraded database schema");
            }

            meta.insert(version_key.as_str(), encode(&current.max(latest))?.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
            meta.insert(OWNER_KEY, encode(&self.owner)?.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))
    }

    /// Recorded schema version of `component`, 0 if never upgraded.
    pub fn version(&self, component: &str) -> Result<u32, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let meta = match txn.open_table(META) {
            Ok(meta) => meta,
            Err(TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };
        Ok(read_value(&meta, &format!("version:{component}"))?.unwrap_or(0))
    }

    fn foreign_tables(&self, txn: &redb::WriteTransaction) -> Result<Vec<String>, StorageError> {
        let known = self.known_tables.lock().unwrap_or_else(PoisonError::into_inner).clone();

        let mut names: Vec<String> = txn
            .list_tables()
            .map_err(|e| StorageError::Io(e.to_string()))?
            .map(|handle| handle.name().to_string())
            .collect();
        names.extend(
            txn.list_multimap_tables()
                .map_err(|e| StorageError::Io(e.to_string()))?
                .map(|handle| handle.name().to_string()),
        );

        names.retain(|name| !known.contains(name));
        names.sort();
        Ok(names)
    }

    /// Store `value` under `key` in `table`.
    pub fn put<T: Serialize>(&self, table: &str, key: &str, value: &T) -> Result<(), StorageError> {
        self.put_raw(table, key, &encode(value)?)
    }

    /// Load and decode the value under `key`.
    pub fn get<T: DeserializeOwned>(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        self.get_raw(table, key)?.map(|bytes| decode(&bytes)).transpose()
    }

    /// Store raw bytes under `key` in `table`.
    pub fn put_raw(&self, table: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let definition: TableDefinition<&str, &[u8]> = TableDefinition::new(table);
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table =
                txn.open_table(definition).map_err(|e| StorageError::Io(e.to_string()))?;
            table.insert(key, value).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))
    }

    /// Raw bytes under `key`. A table that was never created reads as empty.
    pub fn get_raw(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let definition: TableDefinition<&str, &[u8]> = TableDefinition::new(table);
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = match txn.open_table(definition) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };
        let value = table.get(key).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    /// Delete `key` from `table`. Returns true if it existed.
    pub fn remove(&self, table: &str, key: &str) -> Result<bool, StorageError> {
        let definition: TableDefinition<&str, &[u8]> = TableDefinition::new(table);
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        let existed = {
            let mut table =
                txn.open_table(definition).map_err(|e| StorageError::Io(e.to_string()))?;
            let removed = table.remove(key).map_err(|e| StorageError::Io(e.to_string()))?;
            removed.is_some()
        };
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(existed)
    }

    /// All `(key, value)` rows whose key starts with `prefix`, in key order.
    pub fn scan_prefix(
        &self,
        table: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let definition: TableDefinition<&str, &[u8]> = TableDefinition::new(table);
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = match txn.open_table(definition) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };

        let mut rows = Vec::new();
        for entry in table.range(prefix..).map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            rows.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(rows)
    }
}

fn read_value<T, R>(table: &R, key: &str) -> Result<Option<T>, StorageError>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let value = table.get(key).map_err(|e| StorageError::Io(e.to_string()))?;
    value.map(|v| decode(v.value())).transpose()
}

/// CBOR-encode a stored value.
pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

/// Decode a CBOR stored value.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}
