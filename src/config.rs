use std::{
    env, fs,
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;

use crate::naming::{IcannExclusions, NamingPolicy};

pub const APP_NAME: &str = "Fingertip";
pub const CONFIG_FILE_NAME: &str = "fingertip.toml";
pub const STORE_FILE_NAME: &str = "init";
pub const LOCK_FILE_NAME: &str = "enrollment.lock";
pub const DEFAULT_PROXY_ADDR: &str = "127.0.0.1:9590";
pub const APP_DIR_ENV: &str = "FINGERTIP_HOME";
pub const PROXY_ADDR_ENV: &str = "FINGERTIP_PROXY_ADDRESS";

const APP_DIR_MODE: u32 = 0o700;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub naming: NamingConfig,
    pub logging: Option<LoggingConfig>,
    #[serde(skip)]
    source_path: Option<PathBuf>,
}

impl Config {
    /// Reads `fingertip.toml` from the app directory. A missing file yields defaults;
    /// `FINGERTIP_PROXY_ADDRESS` overrides the listen address either way.
    pub fn load(app_dir: &Path) -> anyhow::Result<Self> {
        let path = app_dir.join(CONFIG_FILE_NAME);
        let mut config = match Self::from_path(&path) {
            Ok(config) => config,
            Err(err) if is_not_found(&err) => Self::default(),
            Err(err) => return Err(err),
        };
        config.apply_env_overrides(env::var(PROXY_ADDR_ENV).ok().as_deref());
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut config = Self::from_toml_str(&toml)
            .with_context(|| format!("load config {}", path.display()))?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    fn apply_env_overrides(&mut self, proxy_addr: Option<&str>) {
        if let Some(addr) = proxy_addr.map(str::trim)
            && !addr.is_empty()
        {
            self.proxy.listen = addr.to_owned();
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_listen")]
    pub listen: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_proxy_listen(),
        }
    }
}

impl ProxyConfig {
    pub fn url(&self) -> String {
        proxy_url(&self.listen)
    }

    /// Resolves `listen` into a bindable address; an empty host binds loopback.
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let Some((host, port)) = self.listen.rsplit_once(':') else {
            bail!("invalid proxy address `{}`: missing port", self.listen);
        };
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid proxy address `{}`: bad port", self.listen))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let ip = if host.is_empty() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            host.parse::<IpAddr>()
                .with_context(|| format!("invalid proxy address `{}`: bad host", self.listen))?
        };
        Ok(SocketAddr::new(ip, port))
    }
}

fn default_proxy_listen() -> String {
    DEFAULT_PROXY_ADDR.to_owned()
}

/// `[naming]`: extra constraints layered over the built-in ICANN exclusions.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamingConfig {
    #[serde(default)]
    pub permitted: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default = "default_exclude_icann")]
    pub exclude_icann: bool,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            permitted: Vec::new(),
            excluded: Vec::new(),
            exclude_icann: default_exclude_icann(),
        }
    }
}

impl NamingPolicy for NamingConfig {
    fn permitted_suffixes(&self) -> Vec<String> {
        self.permitted.clone()
    }

    fn excluded_names(&self) -> Vec<String> {
        let mut excluded = if self.exclude_icann {
            IcannExclusions.excluded_names()
        } else {
            Vec::new()
        };
        excluded.extend(self.excluded.iter().cloned());
        excluded
    }
}

fn default_exclude_icann() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Paths of everything the application keeps in its directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub dir: PathBuf,
    pub store: PathBuf,
    /// Serializes enable/disable across processes.
    pub lock: PathBuf,
}

impl AppPaths {
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            store: dir.join(STORE_FILE_NAME),
            lock: dir.join(LOCK_FILE_NAME),
        }
    }
}

pub fn resolve_app_dir(override_dir: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = override_dir {
        return Ok(dir.to_path_buf());
    }
    let Some(config_dir) = dirs::config_dir() else {
        bail!("cannot resolve app directory: no user config directory on this platform");
    };
    Ok(config_dir.join(APP_NAME))
}

pub fn ensure_app_dir(dir: &Path) -> anyhow::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).with_context(|| format!("create app directory {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(dir, fs::Permissions::from_mode(APP_DIR_MODE))
            .with_context(|| format!("set permissions on {}", dir.display()))?;
    }
    Ok(())
}

/// Turns a listen address into the URL browsers use to reach the proxy.
pub fn proxy_url(addr: &str) -> String {
    let Some((host, port)) = addr.split_once(':') else {
        return addr.to_owned();
    };
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    format!("http://{host}:{port}")
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == ErrorKind::NotFound)
    })
}

#[cfg(test)]
mod tests {
    use std::{fs, net::SocketAddr};

    use super::{CONFIG_FILE_NAME, Config, DEFAULT_PROXY_ADDR, LogFormat, proxy_url};
    use crate::naming::NamingPolicy;
    use tempfile::tempdir;

    #[test]
    fn proxy_url_fills_empty_host_with_loopback() {
        assert_eq!(proxy_url(":9590"), "http://127.0.0.1:9590");
        assert_eq!(proxy_url("127.0.0.1:9590"), "http://127.0.0.1:9590");
        assert_eq!(proxy_url("no-port"), "no-port");
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let config = Config::load(temp_dir.path()).expect("missing config should default");
        assert!(config.source_path().is_none());
        assert!(config.naming.excluded.is_empty());
        assert!(config.naming.exclude_icann, "ICANN exclusions are on by default");
        assert!(
            config.naming.excluded_names().iter().any(|name| name == "com"),
            "default policy should exclude ICANN TLDs"
        );
        assert!(config.logging.is_none());
    }

    #[test]
    fn config_file_is_parsed_from_app_dir() {
        let temp_dir = tempdir().expect("tempdir should be created");
        fs::write(
            temp_dir.path().join(CONFIG_FILE_NAME),
            r#"
[proxy]
listen = "127.0.0.1:9700"

[naming]
excluded = ["corp", "lan"]
exclude_icann = false

[logging]
format = "pretty"
"#,
        )
        .expect("config should be written");

        let config = Config::from_path(temp_dir.path().join(CONFIG_FILE_NAME))
            .expect("config should parse");
        assert_eq!(config.proxy.listen, "127.0.0.1:9700");
        assert_eq!(config.naming.excluded, vec!["corp", "lan"]);
        assert_eq!(config.naming.excluded_names(), vec!["corp", "lan"]);
        assert_eq!(
            config.logging.and_then(|logging| logging.format),
            Some(LogFormat::Pretty)
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml_str(
            r#"
[proxy]
listen = "127.0.0.1:0"
unknown_key = "invalid"
"#,
        )
        .expect_err("unknown key should fail");
        assert!(
            err.to_string().contains("parse config TOML"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn env_override_replaces_listen_address() {
        let mut config = Config::from_toml_str("").expect("empty config should parse");
        assert_eq!(config.proxy.listen, DEFAULT_PROXY_ADDR);

        config.apply_env_overrides(Some("  "));
        assert_eq!(config.proxy.listen, DEFAULT_PROXY_ADDR);

        config.apply_env_overrides(Some("127.0.0.1:9999"));
        assert_eq!(config.proxy.listen, "127.0.0.1:9999");
    }

    #[test]
    fn socket_addr_binds_loopback_for_empty_host() {
        let mut config = Config::default();
        config.proxy.listen = ":9590".to_owned();
        assert_eq!(
            config.proxy.socket_addr().expect("address should resolve"),
            "127.0.0.1:9590".parse::<SocketAddr>().expect("literal parses")
        );

        config.proxy.listen = "localhost".to_owned();
        let err = config
            .proxy
            .socket_addr()
            .expect_err("missing port should fail");
        assert!(err.to_string().contains("missing port"), "unexpected error: {err}");
    }
}
