use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::Context as _;

use crate::{
    VERSION,
    browser::{BrowserTarget, Firefox},
    ca::{CertificateAuthority, LoadedAuthority},
    config::{AppPaths, Config, ensure_app_dir},
    enrollment::{Enrollment, SharedStore},
    naming::skipped_names,
    onboarding::{CertCheck, OnboardingState},
    platform::{self, OsEnrollment},
    probe::Probe,
    store::Store,
};

/// Long-lived pieces of one application instance, rooted at an app directory.
pub struct App {
    pub paths: AppPaths,
    pub config: Config,
    pub store: SharedStore,
    pub ca: CertificateAuthority,
    os: Arc<dyn OsEnrollment>,
}

impl App {
    pub fn open(app_dir: &Path, config: Config) -> anyhow::Result<Self> {
        Self::with_platform(app_dir, config, Arc::from(platform::native()))
    }

    pub fn with_platform(
        app_dir: &Path,
        config: Config,
        os: Arc<dyn OsEnrollment>,
    ) -> anyhow::Result<Self> {
        ensure_app_dir(app_dir)?;
        let paths = AppPaths::from_dir(app_dir);
        let store = Store::load(&paths.store, VERSION)
            .with_context(|| format!("load app store {}", paths.store.display()))?;
        let ca = CertificateAuthority::new(app_dir, &config.naming);
        Ok(Self {
            paths,
            config,
            store: Arc::new(Mutex::new(store)),
            ca,
            os,
        })
    }

    pub fn backend(&self) -> String {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .backend()
            .to_owned()
    }

    pub fn enrollment(&self) -> Enrollment {
        let mut browsers: Vec<Box<dyn BrowserTarget>> = Vec::new();
        if let Some(firefox) = Firefox::platform_default() {
            browsers.push(Box::new(firefox));
        }
        Enrollment::new(
            Arc::clone(&self.os),
            browsers,
            Arc::clone(&self.store),
            &self.ca.paths().cert_path,
            &self.config.proxy.url(),
        )
        .with_lock_file(&self.paths.lock)
    }

    /// Whether the OS currently trusts the CA file. Blocking.
    pub fn cert_check(&self) -> CertCheck {
        let os = Arc::clone(&self.os);
        let cert_path = self.ca.paths().cert_path.clone();
        Arc::new(move || os.supported() && os.verify_cert(&cert_path).is_ok())
    }

    pub fn onboarding_state(&self, authority: &LoadedAuthority, probe: Arc<Probe>) -> OnboardingState {
        OnboardingState {
            version: VERSION.to_owned(),
            proxy_addr: self.config.proxy.listen.clone(),
            cert_path: authority.paths.cert_path.clone(),
            cert_pem: authority.certificate_pem.clone(),
            skipped_names: skipped_names(&self.config.naming),
            store: Arc::clone(&self.store),
            probe,
            cert_check: Some(self.cert_check()),
        }
    }
}
