use crate::error::{Result, StoreError};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Device names that collide with reserved filenames on common platforms.
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Typed key/value store over YAML documents with commit semantics.
///
/// Entries live at `devices/{device}.yaml` and
/// `shares/{device}/{share}.yaml` under the store root. Every write is an
/// atomic replace followed by a journal line carrying the commit message.
pub struct ConfigStore {
    root: PathBuf,
    // Serializes writers; readers may interleave with each other freely.
    lock: RwLock<()>,
}

pub fn validate_component(name: &str) -> std::result::Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::InvalidName("name cannot be empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(StoreError::InvalidName(format!(
            "name cannot be a relative path component: {}",
            name
        )));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(StoreError::InvalidName(format!(
            "name cannot contain path separators: {}",
            name
        )));
    }
    if name.contains('\0') {
        return Err(StoreError::InvalidName(
            "name cannot contain null bytes".to_string(),
        ));
    }
    if name.starts_with('.') || name.ends_with('.') {
        return Err(StoreError::InvalidName(format!(
            "name cannot start or end with a dot: {}",
            name
        )));
    }
    if RESERVED_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
        return Err(StoreError::InvalidName(format!(
            "name is reserved: {}",
            name
        )));
    }
    Ok(())
}

impl ConfigStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| StoreError::WriteFailed(format!("{}: {}", root.display(), e)))?;

        Ok(Self {
            root,
            lock: RwLock::new(()),
        })
    }

    fn entry_path(&self, components: &[&str]) -> Result<PathBuf> {
        let mut path = self.root.clone();
        let (last, parents) = components
            .split_last()
            .ok_or_else(|| StoreError::InvalidName("empty entry path".to_string()))?;
        for component in parents {
            validate_component(component)?;
            path.push(component);
        }
        validate_component(last)?;
        // Appended rather than set_extension: names may contain dots.
        path.push(format!("{}.yaml", last));
        Ok(path)
    }

    pub fn put<T: Serialize>(&self, components: &[&str], value: &T, message: &str) -> Result<()> {
        let path = self.entry_path(components)?;
        let yaml = serde_yaml::to_string(value)
            .map_err(|e| StoreError::ParseFailed(e.to_string()))?;

        let _guard = self.lock.write().expect("config store lock poisoned");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::WriteFailed(format!("{}: {}", parent.display(), e)))?;
        }

        // Atomic replace: write a sibling temp file, then rename over the entry.
        let tmp_path = path.with_extension("yaml.tmp");
        fs::write(&tmp_path, yaml.as_bytes())
            .map_err(|e| StoreError::WriteFailed(format!("{}: {}", tmp_path.display(), e)))?;
        fs::rename(&tmp_path, &path)
            .map_err(|e| StoreError::WriteFailed(format!("{}: {}", path.display(), e)))?;

        self.journal(components, message)?;
        debug!(path = %path.display(), message = message, "Config entry committed");
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, components: &[&str]) -> Result<Option<T>> {
        let path = self.entry_path(components)?;

        let _guard = self.lock.read().expect("config store lock poisoned");

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::ReadFailed(format!("{}: {}", path.display(), e)).into())
            }
        };

        let value = serde_yaml::from_str(&content)
            .map_err(|e| StoreError::ParseFailed(format!("{}: {}", path.display(), e)))?;
        Ok(Some(value))
    }

    pub fn delete(&self, components: &[&str], message: &str) -> Result<bool> {
        let path = self.entry_path(components)?;

        let _guard = self.lock.write().expect("config store lock poisoned");

        match fs::remove_file(&path) {
            Ok(()) => {
                self.journal(components, message)?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::WriteFailed(format!("{}: {}", path.display(), e)).into()),
        }
    }

    /// Removes a whole directory of entries, e.g. all shares of a device.
    pub fn delete_tree(&self, components: &[&str], message: &str) -> Result<bool> {
        let mut path = self.root.clone();
        for component in components {
            validate_component(component)?;
            path.push(component);
        }

        let _guard = self.lock.write().expect("config store lock poisoned");

        match fs::remove_dir_all(&path) {
            Ok(()) => {
                self.journal(components, message)?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::WriteFailed(format!("{}: {}", path.display(), e)).into()),
        }
    }

    /// Entry names (file stems) directly under the given directory.
    pub fn list(&self, components: &[&str]) -> Result<Vec<String>> {
        let mut dir = self.root.clone();
        for component in components {
            validate_component(component)?;
            dir.push(component);
        }

        let _guard = self.lock.read().expect("config store lock poisoned");

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::ReadFailed(format!("{}: {}", dir.display(), e)).into())
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| StoreError::ReadFailed(format!("{}: {}", dir.display(), e)))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn journal(&self, components: &[&str], message: &str) -> Result<()> {
        let record = serde_json::json!({
            "timestamp": Utc::now(),
            "path": components.join("/"),
            "message": message,
        });
        let line = format!("{}\n", record);

        let journal_path = self.root.join("commits.log");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .map_err(|e| StoreError::WriteFailed(format!("{}: {}", journal_path.display(), e)))?;
        file.write_all(line.as_bytes())
            .map_err(|e| StoreError::WriteFailed(format!("{}: {}", journal_path.display(), e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        value: String,
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = ConfigStore::open(dir.path()).expect("Failed to open store");

        let entry = Entry {
            value: "hello".to_string(),
        };
        store
            .put(&["devices", "nas1"], &entry, "add device nas1")
            .expect("Failed to put entry");

        let loaded: Option<Entry> = store
            .get(&["devices", "nas1"])
            .expect("Failed to get entry");
        assert_eq!(loaded, Some(entry));

        let missing: Option<Entry> = store
            .get(&["devices", "nas2"])
            .expect("Failed to get missing entry");
        assert!(missing.is_none());
    }

    #[test]
    fn test_list_and_delete() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = ConfigStore::open(dir.path()).expect("Failed to open store");

        let entry = Entry {
            value: "x".to_string(),
        };
        store
            .put(&["shares", "nas1", "photos"], &entry, "add share")
            .expect("Failed to put");
        store
            .put(&["shares", "nas1", "music"], &entry, "add share")
            .expect("Failed to put");

        let names = store.list(&["shares", "nas1"]).expect("Failed to list");
        assert_eq!(names, vec!["music".to_string(), "photos".to_string()]);

        assert!(store
            .delete(&["shares", "nas1", "music"], "remove share")
            .expect("Failed to delete"));
        assert!(!store
            .delete(&["shares", "nas1", "music"], "remove share again")
            .expect("Failed to delete"));

        let names = store.list(&["shares", "nas1"]).expect("Failed to list");
        assert_eq!(names, vec!["photos".to_string()]);
    }

    #[test]
    fn test_delete_tree_cascades() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = ConfigStore::open(dir.path()).expect("Failed to open store");

        let entry = Entry {
            value: "x".to_string(),
        };
        store
            .put(&["shares", "nas1", "photos"], &entry, "add")
            .expect("Failed to put");

        assert!(store
            .delete_tree(&["shares", "nas1"], "remove device shares")
            .expect("Failed to delete tree"));
        assert!(store
            .list(&["shares", "nas1"])
            .expect("Failed to list")
            .is_empty());
    }

    #[test]
    fn test_component_validation() {
        assert!(validate_component("nas1").is_ok());
        assert!(validate_component("my-device_2").is_ok());

        assert!(validate_component("").is_err());
        assert!(validate_component("..").is_err());
        assert!(validate_component("a/b").is_err());
        assert!(validate_component("a\\b").is_err());
        assert!(validate_component("a\0b").is_err());
        assert!(validate_component(".hidden").is_err());
        assert!(validate_component("trailing.").is_err());
        assert!(validate_component("CON").is_err());
        assert!(validate_component("lpt1").is_err());
    }

    #[test]
    fn test_commit_journal_appended() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = ConfigStore::open(dir.path()).expect("Failed to open store");

        let entry = Entry {
            value: "x".to_string(),
        };
        store
            .put(&["devices", "nas1"], &entry, "first commit")
            .expect("Failed to put");
        store
            .put(&["devices", "nas1"], &entry, "second commit")
            .expect("Failed to put");

        let journal = std::fs::read_to_string(dir.path().join("commits.log"))
            .expect("Failed to read journal");
        let lines: Vec<&str> = journal.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("first commit"));
        assert!(lines[1].contains("second commit"));
    }
}
