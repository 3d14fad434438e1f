use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, TryLockError},
};

use anyhow::Context as _;
use serde::Serialize;

use crate::{
    browser::{BrowserTarget, InstallReport},
    platform::OsEnrollment,
    store::Store,
};

pub type SharedStore = Arc<Mutex<Store>>;

#[derive(Debug)]
pub enum EnrollmentError {
    InProgress,
    /// The cross-process lock file could not be opened or locked.
    Lock(anyhow::Error),
    ProxyInstall(anyhow::Error),
    CertInstall(anyhow::Error),
    Persist(anyhow::Error),
}

impl std::fmt::Display for EnrollmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => f.write_str("another enrollment change is already in progress"),
            Self::Lock(err) => write!(f, "acquire enrollment lock: {err:#}"),
            Self::ProxyInstall(err) => write!(f, "configure system proxy: {err:#}"),
            Self::CertInstall(err) => write!(f, "install CA certificate: {err:#}"),
            Self::Persist(err) => write!(
                f,
                "enrollment applied but its state could not be saved: {err:#}"
            ),
        }
    }
}

impl std::error::Error for EnrollmentError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentState {
    pub supported: bool,
    pub auto_config_enabled: bool,
    pub cert_trusted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnableOutcome {
    Enabled { browsers: Vec<InstallReport> },
    /// Automatic enrollment is unavailable here; nothing was changed.
    ManualSetup { setup_url: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisableReport {
    pub failures: Vec<String>,
}

impl DisableReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Applies and reverts host enrollment as a unit. Owns the authoritative
/// `auto_config` flag; at most one transition runs at a time, across
/// processes when a lock file is configured.
pub struct Enrollment {
    os: Arc<dyn OsEnrollment>,
    browsers: Vec<Box<dyn BrowserTarget>>,
    store: SharedStore,
    cert_path: PathBuf,
    proxy_url: String,
    transition: Mutex<()>,
    lock_path: Option<PathBuf>,
}

/// Held for the duration of one enable or disable.
struct Transition<'a> {
    _local: MutexGuard<'a, ()>,
    // Dropping the handle releases the advisory lock.
    _file: Option<File>,
}

impl Enrollment {
    pub fn new(
        os: Arc<dyn OsEnrollment>,
        browsers: Vec<Box<dyn BrowserTarget>>,
        store: SharedStore,
        cert_path: &Path,
        proxy_url: &str,
    ) -> Self {
        Self {
            os,
            browsers,
            store,
            cert_path: cert_path.to_path_buf(),
            proxy_url: proxy_url.to_owned(),
            transition: Mutex::new(()),
            lock_path: None,
        }
    }

    /// Also takes an exclusive lock on `path` for each transition, so separate
    /// processes sharing an app directory cannot interleave.
    pub fn with_lock_file(mut self, path: &Path) -> Self {
        self.lock_path = Some(path.to_path_buf());
        self
    }

    pub fn pac_url(&self) -> String {
        format!("{}/proxy.pac", self.proxy_url)
    }

    pub fn setup_url(&self) -> String {
        format!("{}/setup", self.proxy_url)
    }

    pub fn status(&self) -> EnrollmentState {
        let supported = self.os.supported();
        let auto_config = self.lock_store().auto_config();
        EnrollmentState {
            supported,
            auto_config_enabled: supported && auto_config,
            cert_trusted: supported.then(|| self.os.verify_cert(&self.cert_path).is_ok()),
        }
    }

    /// Routes the host through the proxy and trusts the CA. Either every step
    /// succeeds or proxy routing is reverted before the error is returned.
    pub fn enable(&self) -> Result<EnableOutcome, EnrollmentError> {
        let _transition = self.begin_transition()?;
        if !self.os.supported() {
            tracing::info!("automatic enrollment unsupported on this platform");
            return Ok(EnableOutcome::ManualSetup {
                setup_url: self.setup_url(),
            });
        }

        let pac_url = self.pac_url();
        self.os
            .install_os_proxy(&pac_url)
            .map_err(EnrollmentError::ProxyInstall)?;
        tracing::info!(%pac_url, "system proxy auto-config installed");

        let browsers: Vec<InstallReport> = self
            .browsers
            .iter()
            .map(|browser| browser.install())
            .collect();
        for report in &browsers {
            if let Some(err) = report.last_error() {
                tracing::warn!(browser = %report.browser, "browser configuration incomplete: {err}");
            }
        }

        if let Err(err) = self.os.install_cert(&self.cert_path) {
            tracing::warn!("CA install failed; rolling back proxy configuration: {err:#}");
            let mut rollback_failures = Vec::new();
            self.undo_routing(&pac_url, &mut rollback_failures);
            for failure in rollback_failures {
                tracing::warn!("rollback step failed: {failure}");
            }
            return Err(EnrollmentError::CertInstall(err));
        }
        tracing::info!(cert = %self.cert_path.display(), "CA certificate trusted");

        self.persist_auto_config(true)
            .map_err(EnrollmentError::Persist)?;
        Ok(EnableOutcome::Enabled { browsers })
    }

    /// Best-effort removal of everything `enable` installs. Failures are collected,
    /// never returned as errors, and the flag is cleared regardless.
    pub fn disable(&self) -> Result<DisableReport, EnrollmentError> {
        let _transition = self.begin_transition()?;
        let mut report = DisableReport::default();

        self.undo_routing(&self.pac_url(), &mut report.failures);
        if let Err(err) = self.os.uninstall_cert(&self.cert_path) {
            report
                .failures
                .push(format!("remove CA certificate from trust store: {err:#}"));
        }
        if let Err(err) = self.persist_auto_config(false) {
            report
                .failures
                .push(format!("save enrollment state: {err:#}"));
        }

        for failure in &report.failures {
            tracing::warn!("disable step failed: {failure}");
        }
        Ok(report)
    }

    pub fn set_backend(&self, backend: &str) -> anyhow::Result<()> {
        let mut store = self.lock_store();
        store.reload()?;
        store.set_backend(backend);
        store.save()
    }

    fn undo_routing(&self, pac_url: &str, failures: &mut Vec<String>) {
        if let Err(err) = self.os.uninstall_os_proxy(pac_url) {
            failures.push(format!("remove system proxy configuration: {err:#}"));
        }
        for browser in &self.browsers {
            if let Err(err) = browser.uninstall() {
                failures.push(format!("undo {} configuration: {err}", browser.name()));
            }
        }
    }

    fn persist_auto_config(&self, enabled: bool) -> anyhow::Result<()> {
        let mut store = self.lock_store();
        // Keep a backend written by another process since this one loaded.
        store.reload()?;
        store.set_auto_config(enabled);
        store.save()
    }

    fn begin_transition(&self) -> Result<Transition<'_>, EnrollmentError> {
        let local = match self.transition.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(EnrollmentError::InProgress),
        };
        let file = match &self.lock_path {
            Some(path) => Some(lock_file(path)?),
            None => None,
        };
        Ok(Transition {
            _local: local,
            _file: file,
        })
    }

    fn lock_store(&self) -> MutexGuard<'_, Store> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lock_file(path: &Path) -> Result<File, EnrollmentError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
        .map_err(EnrollmentError::Lock)?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(fs::TryLockError::WouldBlock) => Err(EnrollmentError::InProgress),
        Err(fs::TryLockError::Error(err)) => Err(EnrollmentError::Lock(
            anyhow::Error::new(err).context(format!("lock {}", path.display())),
        )),
    }
}
