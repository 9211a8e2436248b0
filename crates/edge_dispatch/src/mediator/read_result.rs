//! Pre-read results handed to event handlers.

use crate::error::ReadResultError;
use crate::marshal::TagValue;
use crate::types::{Quality, RawValue, ReadValue};
use std::collections::HashMap;

/// Values fetched before an event handler runs, keyed by alias.
///
/// Built once per handler invocation and read-only afterwards. A pre-read
/// that failed with `continue_on_failure` leaves a placeholder of
/// [`Quality::CommError`] under its alias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResult {
    values: HashMap<String, ReadValue>,
}

impl ReadResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, alias: impl Into<String>, value: ReadValue) {
        self.values.insert(alias.into(), value);
    }

    /// The typed value under `alias`, or `T::default()` when it is absent or
    /// cannot be converted.
    pub fn get<T: TagValue>(&self, alias: &str) -> T {
        self.values
            .get(alias)
            .and_then(|read| T::from_raw(&read.value).ok())
            .unwrap_or_default()
    }

    /// The typed value under `alias`.
    ///
    /// Fails when nothing usable was read (including failed pre-reads) or
    /// the value cannot be converted.
    pub fn get_required<T: TagValue>(&self, alias: &str) -> Result<T, ReadResultError> {
        let read = self
            .values
            .get(alias)
            .filter(|read| read.quality != Quality::CommError)
            .ok_or_else(|| ReadResultError::Missing {
                alias: alias.to_string(),
            })?;

        T::from_raw(&read.value).map_err(|source| ReadResultError::Conversion {
            alias: alias.to_string(),
            source,
        })
    }

    pub fn read(&self, alias: &str) -> Option<&ReadValue> {
        self.values.get(alias)
    }

    pub fn raw(&self, alias: &str) -> Option<&RawValue> {
        self.values.get(alias).map(|read| &read.value)
    }

    pub fn quality(&self, alias: &str) -> Option<Quality> {
        self.values.get(alias).map(|read| read.quality)
    }

    pub fn is_good(&self, alias: &str) -> bool {
        self.quality(alias).is_some_and(Quality::is_good)
    }

    /// All aliases, sorted.
    pub fn aliases(&self) -> Vec<&str> {
        let mut aliases: Vec<&str> = self.values.keys().map(String::as_str).collect();
        aliases.sort_unstable();
        aliases
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
