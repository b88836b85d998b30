use std::fmt;
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use super::CacheError;

/// Separator between the table and owner components in a displayed key.
const OWNER_SEPARATOR: char = '/';

/// A logical table in the remote store whose contents can be cached whole.
///
/// ```ignore
/// struct Soldiers;
/// impl Table for Soldiers {
///     const NAME: &'static str = "soldiers";
///     type Record = Soldier;
/// }
/// ```
pub trait Table {
    const NAME: &'static str;
    type Record: Serialize + DeserializeOwned + Send + 'static;
}

/// Opaque cache key: a table name, optionally scoped to one owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    table: String,
    owner: Option<String>,
}

impl CacheKey {
    /// Table-wide key.
    pub fn table(table: impl Into<String>) -> Result<Self, CacheError> {
        Self::build(table.into(), None)
    }

    /// Owner-scoped key for per-user caches of a table.
    pub fn scoped(table: impl Into<String>, owner: impl Into<String>) -> Result<Self, CacheError> {
        Self::build(table.into(), Some(owner.into()))
    }

    fn build(table: String, owner: Option<String>) -> Result<Self, CacheError> {
        validate_table_name(&table)?;
        if matches!(owner.as_deref(), Some("")) {
            return Err(CacheError::InvalidKey(format!("empty owner for table '{}'", table)));
        }
        Ok(Self { table, owner })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            Some(ref owner) => write!(f, "{}{}{}", self.table, OWNER_SEPARATOR, owner),
            None => f.write_str(&self.table),
        }
    }
}

impl AsRef<CacheKey> for CacheKey {
    fn as_ref(&self) -> &CacheKey {
        self
    }
}

/// Table names must be non-empty ASCII alphanumerics, `_` or `-`.
pub(crate) fn validate_table_name(name: &str) -> Result<(), CacheError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(format!("invalid table name '{}'", name)))
    }
}

/// Type-safe key for table `T`. Constructed from the table's static name, so
/// it cannot fail validation at runtime beyond an empty owner.
pub struct TableKey<T: Table> {
    key: CacheKey,
    _table: PhantomData<fn() -> T>,
}

impl<T: Table> TableKey<T> {
    pub fn all() -> Self {
        Self {
            key: CacheKey {
                table: T::NAME.to_string(),
                owner: None,
            },
            _table: PhantomData,
        }
    }

    pub fn owned_by(owner: impl Into<String>) -> Result<Self, CacheError> {
        Ok(Self {
            key: CacheKey::scoped(T::NAME, owner)?,
            _table: PhantomData,
        })
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl<T: Table> AsRef<CacheKey> for TableKey<T> {
    fn as_ref(&self) -> &CacheKey {
        &self.key
    }
}

impl<T: Table> Clone for TableKey<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _table: PhantomData,
        }
    }
}

impl<T: Table> fmt::Debug for TableKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TableKey").field(&self.key).finish()
    }
}
