use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;
use serde::Serialize;

/// Ownership tag written as the first line of every file this crate creates.
/// Never change it: later versions rely on it to clean up earlier installs.
pub const OWNERSHIP_MARKER: &str = "// AUTOCONFIG:FINGERTIP";

const OWNERSHIP_NOTE: &str =
    "(autogenerated - remove this line to disable auto config for this profile and edit the file)";
const FIREFOX_PREFS_FILE: &str = "prefs.js";
const FIREFOX_OVERRIDE_FILE: &str = "user.js";
const FIREFOX_PROXY_TYPE_KEY: &str = "network.proxy.type";
const DEFAULT_PROFILE_HINT: &str = "default";
/// `network.proxy.type` values that leave routing to us: 0 (none) and 5 (system).
const COMPATIBLE_PROXY_TYPES: [u32; 2] = [0, 5];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    None,
    Installed,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    Discovery { root: PathBuf, message: String },
    Conflict { profile: PathBuf, setting: String },
    Io { path: PathBuf, message: String },
}

impl std::fmt::Display for BrowserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovery { root, message } => {
                write!(f, "list browser profiles in {}: {message}", root.display())
            }
            Self::Conflict { profile, setting } => write!(
                f,
                "profile {} has its own proxy configuration (`{setting}`); left untouched",
                profile.display()
            ),
            Self::Io { path, message } => write!(f, "{}: {message}", path.display()),
        }
    }
}

impl std::error::Error for BrowserError {}

impl BrowserError {
    fn io(path: &Path, action: &str, err: &io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: format!("{action}: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileReport {
    pub profile: PathBuf,
    pub status: EnrollmentStatus,
}

/// Outcome of configuring every discovered profile of one browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub browser: String,
    pub profiles: Vec<ProfileReport>,
    pub errors: Vec<BrowserError>,
}

impl InstallReport {
    fn new(browser: &str) -> Self {
        Self {
            browser: browser.to_owned(),
            profiles: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn last_error(&self) -> Option<&BrowserError> {
        self.errors.last()
    }
}

/// A browser whose preference files can be patched to trust the OS and follow its proxy.
pub trait BrowserTarget: Send + Sync {
    fn name(&self) -> &str;

    /// Configures every profile, attempting all of them even after failures.
    fn install(&self) -> InstallReport;

    /// Removes what `install` wrote. Profile discovery failures are not errors.
    fn uninstall(&self) -> Result<(), BrowserError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagState {
    Absent,
    Owned,
    Foreign,
}

/// A file in someone else's directory that we only touch when it carries our marker.
#[derive(Debug, Clone, Copy)]
pub struct TaggedFile<'a> {
    path: &'a Path,
    marker: &'a str,
}

impl<'a> TaggedFile<'a> {
    pub fn new(path: &'a Path, marker: &'a str) -> Self {
        Self { path, marker }
    }

    pub fn state(&self) -> io::Result<TagState> {
        match find_line(self.path, self.marker)? {
            None if !self.path.exists() => Ok(TagState::Absent),
            None => Ok(TagState::Foreign),
            Some(_) => Ok(TagState::Owned),
        }
    }

    /// Contents written by [`TaggedFile::write`]: the marker line, then `lines`.
    pub fn render(&self, note: &str, lines: &[String]) -> String {
        let mut contents = format!("{} {note}\n", self.marker);
        for line in lines {
            contents.push_str(line);
            contents.push('\n');
        }
        contents
    }

    pub fn write(&self, note: &str, lines: &[String]) -> io::Result<()> {
        fs::write(self.path, self.render(note, lines))
    }

    /// Deletes the file when it carries the marker; returns whether it did.
    pub fn remove_if_owned(&self) -> io::Result<bool> {
        if self.state()? != TagState::Owned {
            return Ok(false);
        }
        fs::remove_file(self.path)?;
        Ok(true)
    }
}

/// Firefox: trust OS roots and follow the system proxy via `user.js` in each default profile.
#[derive(Debug, Clone)]
pub struct Firefox {
    profile_root: PathBuf,
}

impl Firefox {
    pub fn new(profile_root: impl Into<PathBuf>) -> Self {
        Self {
            profile_root: profile_root.into(),
        }
    }

    pub fn platform_default() -> Option<Self> {
        default_firefox_profile_root().map(Self::new)
    }

    /// Profile directories whose name marks them as a default profile, sorted.
    pub fn profiles(&self) -> Result<Vec<PathBuf>, BrowserError> {
        let entries = fs::read_dir(&self.profile_root).map_err(|err| BrowserError::Discovery {
            root: self.profile_root.clone(),
            message: err.to_string(),
        })?;

        let mut profiles: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .contains(DEFAULT_PROFILE_HINT)
            })
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        profiles.sort();
        Ok(profiles)
    }

    pub fn override_lines() -> Vec<String> {
        vec![
            pref_line("security.enterprise_roots.enabled", "true"),
            pref_line(FIREFOX_PROXY_TYPE_KEY, "5"),
        ]
    }

    fn install_profile(&self, profile: &Path) -> Result<EnrollmentStatus, BrowserError> {
        let prefs = profile.join(FIREFOX_PREFS_FILE);
        if let Some(setting) = conflicting_proxy_setting(&prefs)? {
            return Err(BrowserError::Conflict {
                profile: profile.to_path_buf(),
                setting,
            });
        }

        let override_path = profile.join(FIREFOX_OVERRIDE_FILE);
        let override_file = TaggedFile::new(&override_path, OWNERSHIP_MARKER);
        let state = override_file
            .state()
            .map_err(|err| BrowserError::io(&override_path, "inspect override file", &err))?;
        if state == TagState::Foreign {
            tracing::info!(
                profile = %profile.display(),
                "existing user.js without ownership marker; skipping profile"
            );
            return Ok(EnrollmentStatus::None);
        }

        override_file
            .write(OWNERSHIP_NOTE, &Self::override_lines())
            .map_err(|err| BrowserError::io(&override_path, "write override file", &err))?;
        Ok(EnrollmentStatus::Installed)
    }
}

impl BrowserTarget for Firefox {
    fn name(&self) -> &str {
        "firefox"
    }

    fn install(&self) -> InstallReport {
        let mut report = InstallReport::new(self.name());
        let profiles = match self.profiles() {
            Ok(profiles) => profiles,
            Err(err) => {
                tracing::debug!("firefox profile discovery failed: {err}");
                report.errors.push(err);
                return report;
            }
        };

        for profile in profiles {
            let status = match self.install_profile(&profile) {
                Ok(status) => status,
                Err(err) => {
                    tracing::warn!(profile = %profile.display(), "firefox profile not configured: {err}");
                    let status = match err {
                        BrowserError::Conflict { .. } => EnrollmentStatus::Conflict,
                        _ => EnrollmentStatus::None,
                    };
                    report.errors.push(err);
                    status
                }
            };
            report.profiles.push(ProfileReport { profile, status });
        }
        report
    }

    fn uninstall(&self) -> Result<(), BrowserError> {
        let profiles = match self.profiles() {
            Ok(profiles) => profiles,
            Err(err) => {
                tracing::debug!("skipping firefox cleanup: {err}");
                return Ok(());
            }
        };

        let mut last_error = None;
        for profile in profiles {
            let override_path = profile.join(FIREFOX_OVERRIDE_FILE);
            match TaggedFile::new(&override_path, OWNERSHIP_MARKER).remove_if_owned() {
                Ok(true) => {
                    tracing::info!(profile = %profile.display(), "removed firefox override file");
                }
                Ok(false) => {}
                Err(err) => {
                    last_error = Some(BrowserError::io(
                        &override_path,
                        "remove override file",
                        &err,
                    ));
                }
            }
        }
        last_error.map_or(Ok(()), Err)
    }
}

fn default_firefox_profile_root() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        dirs::config_dir().map(|dir| dir.join("Firefox").join("Profiles"))
    }

    #[cfg(target_os = "windows")]
    {
        dirs::config_dir().map(|dir| dir.join("Mozilla").join("Firefox").join("Profiles"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        dirs::home_dir().map(|dir| dir.join(".mozilla").join("firefox"))
    }
}

fn pref_line(key: &str, value: &str) -> String {
    format!("user_pref(\"{key}\", {value});")
}

/// The `network.proxy.type` line of `prefs` when its value is one we must not override.
fn conflicting_proxy_setting(prefs: &Path) -> Result<Option<String>, BrowserError> {
    let line = match find_line(prefs, &format!("\"{FIREFOX_PROXY_TYPE_KEY}\"")) {
        Ok(Some(line)) => line,
        Ok(None) => return Ok(None),
        Err(err) => return Err(BrowserError::io(prefs, "read preferences", &err)),
    };

    let compatible = proxy_type_regex()
        .captures(&line)
        .and_then(|captures| captures[1].parse::<u32>().ok())
        .is_some_and(|value| COMPATIBLE_PROXY_TYPES.contains(&value));
    Ok((!compatible).then(|| line.trim().to_owned()))
}

fn proxy_type_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#""network\.proxy\.type"\s*,\s*(\d+)\s*\)"#)
            .expect("proxy type regex should compile")
    })
}

/// First line of `path` containing `needle`. A missing file has no lines.
fn find_line(path: &Path, needle: &str) -> io::Result<Option<String>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    Ok(String::from_utf8_lossy(&bytes)
        .lines()
        .find(|line| line.contains(needle))
        .map(str::to_owned))
}
