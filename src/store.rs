use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BACKEND: &str = "sane";

const STORE_FILE_MODE: u32 = 0o664;

/// Enrollment state persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Store {
    version: String,
    auto_config: bool,
    backend: String,
    #[serde(skip)]
    path: PathBuf,
}

/// On-disk shape; every field is optional so older files merge into current defaults.
#[derive(Debug, Default, Deserialize)]
struct StoreFile {
    version: Option<String>,
    auto_config: Option<bool>,
    backend: Option<String>,
}

impl Store {
    pub fn with_defaults(path: &Path, version: &str) -> Self {
        Self {
            version: version.to_owned(),
            auto_config: false,
            backend: DEFAULT_BACKEND.to_owned(),
            path: path.to_path_buf(),
        }
    }

    /// Loads the store at `path`. Absent or empty files yield defaults.
    pub fn load(path: &Path, version: &str) -> anyhow::Result<Self> {
        let mut store = Self::with_defaults(path, version);
        store.reload()?;
        Ok(store)
    }

    /// Merges the file contents over the current in-memory values.
    pub fn reload(&mut self) -> anyhow::Result<()> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read app store {}", self.path.display()));
            }
        };
        if bytes.is_empty() {
            return Ok(());
        }

        let file: StoreFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse app store {}", self.path.display()))?;
        if let Some(version) = file.version {
            self.version = version;
        }
        if let Some(auto_config) = file.auto_config {
            self.auto_config = auto_config;
        }
        if let Some(backend) = file.backend {
            self.backend = backend;
        }
        Ok(())
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let body = serde_json::to_vec(self).context("encode app store")?;
        let mut file = open_for_write(&self.path)
            .with_context(|| format!("open app store {}", self.path.display()))?;
        file.write_all(&body)
            .with_context(|| format!("write app store {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), auto_config = self.auto_config, "saved app store");
        Ok(())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn auto_config(&self) -> bool {
        self.auto_config
    }

    pub fn set_auto_config(&mut self, enabled: bool) {
        self.auto_config = enabled;
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn set_backend(&mut self, backend: impl Into<String>) {
        self.backend = backend.into();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_for_write(path: &Path) -> std::io::Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    opts.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;

        opts.mode(STORE_FILE_MODE);
    }
    #[cfg(not(unix))]
    let _ = STORE_FILE_MODE;
    opts.open(path)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::Value;
    use tempfile::tempdir;

    use super::{DEFAULT_BACKEND, Store};

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let store = Store::load(&temp_dir.path().join("init"), "0.0.3").expect("load");

        assert!(!store.auto_config());
        assert_eq!(store.backend(), DEFAULT_BACKEND);
        assert_eq!(store.version(), "0.0.3");
    }

    #[test]
    fn empty_file_yields_defaults() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let path = temp_dir.path().join("init");
        fs::write(&path, "").expect("seed empty store");

        let store = Store::load(&path, "0.0.3").expect("load");
        assert_eq!(store, Store::with_defaults(&path, "0.0.3"));
    }

    #[test]
    fn whitespace_only_file_is_a_parse_error() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let path = temp_dir.path().join("init");
        fs::write(&path, " \n").expect("seed blank store");

        let err = Store::load(&path, "0.0.3").expect_err("blank store is not empty");
        assert!(
            err.to_string().contains("parse app store"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let path = temp_dir.path().join("init");
        fs::write(&path, r#"{"auto_config":true}"#).expect("seed partial store");

        let store = Store::load(&path, "0.0.3").expect("load");
        assert!(store.auto_config());
        assert_eq!(store.backend(), DEFAULT_BACKEND);
        assert_eq!(store.version(), "0.0.3");
    }

    #[test]
    fn legacy_backend_is_kept_verbatim() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let path = temp_dir.path().join("init");
        fs::write(
            &path,
            r#"{"version":"0.0.1","auto_config":false,"backend":"letsdane"}"#,
        )
        .expect("seed legacy store");

        let store = Store::load(&path, "0.0.3").expect("load");
        assert_eq!(store.backend(), "letsdane");
        assert_eq!(store.version(), "0.0.1");
    }

    #[test]
    fn invalid_json_is_reported() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let path = temp_dir.path().join("init");
        fs::write(&path, "{not json").expect("seed broken store");

        let err = Store::load(&path, "0.0.3").expect_err("broken store should fail");
        assert!(
            err.to_string().contains("parse app store"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn save_writes_all_fields_and_reload_merges() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let path = temp_dir.path().join("init");
        let mut store = Store::load(&path, "0.0.3").expect("load");
        store.set_auto_config(true);
        store.set_backend("custom");
        store.save().expect("save should succeed");

        let saved: Value =
            serde_json::from_slice(&fs::read(&path).expect("store readable")).expect("json");
        assert_eq!(
            saved,
            serde_json::json!({"version": "0.0.3", "auto_config": true, "backend": "custom"})
        );

        let mut other = Store::with_defaults(&path, "9.9.9");
        other.reload().expect("reload should succeed");
        assert_eq!(other, store);
    }

    #[cfg(unix)]
    #[test]
    fn saved_store_is_group_writable() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempdir().expect("tempdir should be created");
        let path = temp_dir.path().join("init");
        Store::load(&path, "0.0.3")
            .expect("load")
            .save()
            .expect("save should succeed");

        let mode = fs::metadata(&path).expect("store exists").permissions().mode() & 0o777;
        // umask may clear group write, never adds bits.
        assert_eq!(mode & !0o664, 0, "unexpected store mode {mode:o}");
    }
}
