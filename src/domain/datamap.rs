//! Data maps: per-node units of data with partial-failure flags
//!
//! An entry with `skip = true` belongs to a job that failed. Consumers treat
//! such entries as absent instead of aborting the batch; a batch only fails
//! outright when every entry is skipped.

use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};

use crate::domain::error::DispatchError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMapEntry {
    pub host: String,
    pub file: String,
    #[serde(default)]
    pub skip: bool
}

impl DataMapEntry {
    pub fn new(host: impl Into<String>, file: impl Into<String>) -> Self {
        Self { host: host.into(), file: file.into(), skip: false }
    }
}

impl fmt::Display for DataMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.host, self.file, if self.skip { " (skipped)" } else { "" })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataMap {
    entries: Vec<DataMapEntry>
}

impl DataMap {
    pub fn new(entries: Vec<DataMapEntry>) -> Self {
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self, DispatchError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), DispatchError> {
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn entries(&self) -> &[DataMapEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose producing job succeeded
    pub fn active(&self) -> impl Iterator<Item = &DataMapEntry> {
        self.entries.iter().filter(|entry| !entry.skip)
    }

    pub fn skipped_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.skip).count()
    }

    /// Mark entries skipped where the job at the same index failed
    pub fn apply_outcomes(&mut self, succeeded: &[bool]) -> Result<(), DispatchError> {
        if succeeded.len() != self.entries.len() {
            return Err(DispatchError::Validation(format!(
                "{} outcomes for a data map of {} entries",
                succeeded.len(),
                self.entries.len()
            )));
        }

        for (entry, ok) in self.entries.iter_mut().zip(succeeded) {
            entry.skip |= !ok;
        }
        Ok(())
    }

    /// Fails only when every entry is skipped
    pub fn validate(&self) -> Result<(), DispatchError> {
        if !self.entries.is_empty() && self.active().next().is_none() {
            return Err(DispatchError::Execution(format!("all {} entries of the data map failed", self.len())));
        }
        Ok(())
    }

    /// Propagate skip flags across maps that describe the same items
    pub fn align(maps: &mut [&mut DataMap]) -> Result<(), DispatchError> {
        let Some(len) = maps.first().map(|map| map.len()) else {
            return Ok(());
        };
        if maps.iter().any(|map| map.len() != len) {
            return Err(DispatchError::Validation("cannot align data maps of different lengths".to_string()));
        }

        for index in 0..len {
            let skip = maps.iter().any(|map| map.entries[index].skip);
            for map in maps.iter_mut() {
                map.entries[index].skip = skip;
            }
        }
        Ok(())
    }

    /// "N of M succeeded"
    pub fn summary(&self) -> String {
        format!("{} of {} succeeded", self.len() - self.skipped_count(), self.len())
    }
}

impl FromIterator<DataMapEntry> for DataMap {
    fn from_iter<I: IntoIterator<Item = DataMapEntry>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
