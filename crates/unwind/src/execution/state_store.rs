//! Durable JSON records: the `PositionState` by default, and the paper
//! venue ledger in dry runs.
//!
//! Writes go to `<path>.tmp`, are fsynced and then renamed over the record, so
//! a crash leaves either the previous or the new record on disk.

use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::errors::UnwindError;
use crate::types::PositionState;

pub struct JsonStateStore<T = PositionState> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonStateStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when nothing has been persisted yet. A record that fails to
    /// parse is an error, never silently reset.
    pub fn load(&self) -> Result<Option<T>, UnwindError> {
        match fs::read_to_string(&self.path) {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, record: &T) -> Result<(), UnwindError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(record)?;
        let temp_path = self.temp_path();

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        debug!(path = %self.path.display(), "record saved");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FuseStatus, FuseThresholds};
    use alloy::primitives::address;
    use rust_decimal_macros::dec;

    fn state() -> PositionState {
        PositionState::new(
            address!("00000000000000000000000000000000000000aa"),
            address!("00000000000000000000000000000000000000bb"),
            address!("00000000000000000000000000000000000000cc"),
            true,
            1,
            -10,
            10,
            0,
            FuseThresholds::from_array([dec!(0.5), dec!(0.7), dec!(1.5), dec!(1.3)]),
        )
    }

    #[test]
    fn test_missing_file_loads_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store: JsonStateStore = JsonStateStore::new(tmp.path().join("state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store: JsonStateStore = JsonStateStore::new(tmp.path().join("nested").join("state.json"));

        let mut s = state();
        s.fuse_status = FuseStatus::OnUpperLimit;
        s.withdraw_done = true;
        s.invested_assets = dec!(1234.5);
        store.save(&s).unwrap();

        assert_eq!(store.load().unwrap(), Some(s.clone()));
        assert!(!store.temp_path().exists());

        // Overwrite replaces the record.
        s.withdraw_done = false;
        store.save(&s).unwrap();
        assert!(!store.load().unwrap().unwrap().withdraw_done);
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store: JsonStateStore = JsonStateStore::new(path);
        assert!(matches!(store.load(), Err(UnwindError::SerdeJson(_))));
    }
}
