//! # Durable state store
//! One JSON record per concern under the state directory, each tagged with a
//! `version` field. Loads substitute a documented default on missing or
//! corrupt files so a bad record never takes the scheduler down; saves go
//! through a temp file and an atomic rename so a crash mid-write cannot leave
//! a truncated record.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Read a record, falling back to `fallback()` when the file is absent or
    /// does not parse. Corruption is a warning, never an error.
    pub fn load<T, F>(&self, name: &str, fallback: F) -> T
    where
        T: DeserializeOwned,
        F: FnOnce() -> T,
    {
        let path = self.record_path(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return fallback(),
        };
        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(record = name, error = %e, "corrupt state record, using fallback");
                fallback()
            }
        }
    }

    /// Atomic replace-on-write: serialize to `<name>.json.tmp`, then rename
    /// over `<name>.json`.
    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating state dir {}", self.dir.display()))?;
        let path = self.record_path(name);
        let tmp = self.dir.join(format!("{name}.json.tmp"));
        let body = serde_json::to_string_pretty(value).context("serializing state record")?;
        fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        version: u32,
        items: Vec<String>,
    }

    fn sample() -> Sample {
        Sample {
            version: 1,
            items: vec!["a".into(), "b".into()],
        }
    }

    #[test]
    fn round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        store.save("sample", &sample()).unwrap();
        let loaded: Sample = store.load("sample", || Sample { version: 0, items: vec![] });
        assert_eq!(loaded, sample());
    }

    #[test]
    fn missing_file_yields_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        let loaded: Sample = store.load("absent", sample);
        assert_eq!(loaded, sample());
    }

    #[test]
    fn corrupt_file_yields_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        fs::create_dir_all(tmp.path()).unwrap();
        fs::write(tmp.path().join("bad.json"), "{ not json").unwrap();
        let loaded: Sample = store.load("bad", sample);
        assert_eq!(loaded, sample());
    }

    #[test]
    fn save_leaves_no_tmp_file_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        store.save("sample", &sample()).unwrap();
        assert!(tmp.path().join("sample.json").exists());
        assert!(!tmp.path().join("sample.json.tmp").exists());
    }
}
