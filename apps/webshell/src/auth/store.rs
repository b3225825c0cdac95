use crate::auth::error::StoreError;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// On-disk key/value entries, the CLI's stand-in for browser local storage.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct StoreFile {
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    path: PathBuf,
}

impl LocalStore {
    pub fn default_path() -> Result<PathBuf, StoreError> {
        let base = BaseDirs::new().ok_or(StoreError::NoHomeDirectory)?;
        Ok(base.home_dir().join(".webshell").join("storage.toml"))
    }

    pub fn open_default() -> Result<Self, StoreError> {
        Ok(Self::at(Self::default_path()?))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<StoreFile, StoreError> {
        if !self.path.exists() {
            return Ok(StoreFile::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Reads one entry. Only that entry has to be a string, so a stray
    /// value under another key does not hide this one.
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        let table: toml::Table = raw.parse()?;
        let Some(entries) = table.get("entries") else {
            return Ok(None);
        };
        let entries = entries.as_table().ok_or_else(|| StoreError::InvalidEntry {
            key: "entries".into(),
            found: entries.type_str(),
        })?;
        match entries.get(key) {
            None => Ok(None),
            Some(toml::Value::String(value)) => {
                let value = value.trim();
                Ok((!value.is_empty()).then(|| value.to_string()))
            }
            Some(other) => Err(StoreError::InvalidEntry {
                key: key.to_string(),
                found: other.type_str(),
            }),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut file = self.load()?;
        file.entries.insert(key.to_string(), value.trim().to_string());
        self.save(&file)
    }

    /// Returns whether the key was present.
    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut file = self.load()?;
        let removed = file.entries.remove(key).is_some();
        if removed {
            self.save(&file)?;
        }
        Ok(removed)
    }

    fn save(&self, file: &StoreFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let serialized = toml::to_string_pretty(file)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut handle = options.open(&self.path)?;
        handle.write_all(serialized.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = handle.metadata()?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::at(dir.path().join("absent.toml"));
        assert_eq!(store.load().unwrap(), StoreFile::default());
        assert_eq!(store.get("token").unwrap(), None);
    }

    #[test]
    fn set_get_remove_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::at(dir.path().join("nested").join("storage.toml"));

        store.set("token", "  abc.def  ").unwrap();
        assert_eq!(store.get("token").unwrap().as_deref(), Some("abc.def"));

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("[entries]"));

        assert!(store.remove("token").unwrap());
        assert!(!store.remove("token").unwrap());
        assert_eq!(store.get("token").unwrap(), None);
    }

    #[test]
    fn blank_values_are_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        fs::write(&path, "[entries]\ntoken = \"   \"\n").unwrap();
        let store = LocalStore::at(path);
        assert_eq!(store.get("token").unwrap(), None);
    }

    #[test]
    fn non_string_entry_fails_only_its_own_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        fs::write(&path, "[entries]\ntoken = 42\nauth_token = \"abc\"\n").unwrap();
        let store = LocalStore::at(path);
        assert!(matches!(
            store.get("token"),
            Err(StoreError::InvalidEntry { ref key, found: "integer" }) if key == "token"
        ));
        assert_eq!(store.get("auth_token").unwrap().as_deref(), Some("abc"));
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::at(dir.path().join("storage.toml"));
        store.set("auth_token", "secret").unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
