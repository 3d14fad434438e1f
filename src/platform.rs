//! OS-level enrollment: the system proxy auto-config pointer and the platform trust store.

use std::{env, path::Path, process::Output};

use anyhow::bail;

/// Per-platform capability the enrollment flow drives. Implementations may block on
/// external processes.
pub trait OsEnrollment: Send + Sync {
    fn supported(&self) -> bool;

    fn install_os_proxy(&self, pac_url: &str) -> anyhow::Result<()>;

    fn uninstall_os_proxy(&self, pac_url: &str) -> anyhow::Result<()>;

    fn install_cert(&self, cert_path: &Path) -> anyhow::Result<()>;

    fn uninstall_cert(&self, cert_path: &Path) -> anyhow::Result<()>;

    fn verify_cert(&self, cert_path: &Path) -> anyhow::Result<()>;
}

/// The implementation for the platform this binary was built for.
pub fn native() -> Box<dyn OsEnrollment> {
    #[cfg(target_os = "macos")]
    {
        Box::new(macos::MacOs)
    }

    #[cfg(not(target_os = "macos"))]
    {
        Box::new(Unsupported)
    }
}

/// Platforms without automatic enrollment; users follow the manual setup page.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

impl OsEnrollment for Unsupported {
    fn supported(&self) -> bool {
        false
    }

    fn install_os_proxy(&self, _pac_url: &str) -> anyhow::Result<()> {
        bail!(
            "automatic proxy configuration is not implemented for `{}`",
            env::consts::OS
        )
    }

    fn uninstall_os_proxy(&self, _pac_url: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn install_cert(&self, cert_path: &Path) -> anyhow::Result<()> {
        bail!(
            "automatic CA install is not implemented for `{}`; install {} manually",
            env::consts::OS,
            cert_path.display()
        )
    }

    fn uninstall_cert(&self, _cert_path: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn verify_cert(&self, cert_path: &Path) -> anyhow::Result<()> {
        bail!(
            "cannot verify trust of {} on `{}`",
            cert_path.display(),
            env::consts::OS
        )
    }
}

/// Compares proxy URLs ignoring case, surrounding whitespace and a trailing slash.
pub fn equal_url(a: &str, b: &str) -> bool {
    let normalize = |url: &str| url.trim().trim_end_matches('/').to_ascii_lowercase();
    normalize(a) == normalize(b)
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn command_exists(name: &str) -> bool {
    let Some(path) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn command_failure_summary(output: &Output) -> String {
    let stderr = trim_bytes(output.stderr.as_slice());
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = trim_bytes(output.stdout.as_slice());
    if !stdout.is_empty() {
        return stdout;
    }
    match output.status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_owned(),
    }
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn trim_bytes(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_owned()
}

#[cfg(target_os = "macos")]
mod macos {
    use std::{
        env,
        path::{Path, PathBuf},
        process::{Command, Output},
    };

    use anyhow::{Context, bail};

    use super::{OsEnrollment, command_exists, command_failure_summary, equal_url};
    use crate::ca::CA_COMMON_NAME;

    const LOGIN_KEYCHAIN: &str = "Library/Keychains/login.keychain-db";

    #[derive(Debug, Clone, Copy, Default)]
    pub struct MacOs;

    impl OsEnrollment for MacOs {
        fn supported(&self) -> bool {
            command_exists("networksetup") && command_exists("security")
        }

        fn install_os_proxy(&self, pac_url: &str) -> anyhow::Result<()> {
            for service in network_services()? {
                run(
                    Command::new("networksetup").args(["-setautoproxyurl", service.as_str(), pac_url]),
                    "networksetup -setautoproxyurl",
                )?;
                run(
                    Command::new("networksetup").args(["-setautoproxystate", service.as_str(), "on"]),
                    "networksetup -setautoproxystate",
                )?;
                tracing::info!(%service, pac_url, "enabled automatic proxy configuration");
            }
            Ok(())
        }

        fn uninstall_os_proxy(&self, pac_url: &str) -> anyhow::Result<()> {
            let mut last_error = None;
            for service in network_services()? {
                let output = Command::new("networksetup")
                    .args(["-getautoproxyurl", service.as_str()])
                    .output()
                    .context("run `networksetup -getautoproxyurl`")?;
                let current = String::from_utf8_lossy(&output.stdout);
                let ours = current
                    .lines()
                    .filter_map(|line| line.strip_prefix("URL:"))
                    .any(|url| equal_url(url, pac_url));
                if !ours {
                    continue;
                }
                if let Err(err) = run(
                    Command::new("networksetup").args(["-setautoproxystate", service.as_str(), "off"]),
                    "networksetup -setautoproxystate",
                ) {
                    last_error = Some(err);
                }
            }
            last_error.map_or(Ok(()), Err)
        }

        fn install_cert(&self, cert_path: &Path) -> anyhow::Result<()> {
            let keychain = login_keychain()?;
            run(
                Command::new("security")
                    .arg("add-trusted-cert")
                    .args(["-r", "trustRoot", "-k"])
                    .arg(&keychain)
                    .arg(cert_path),
                "security add-trusted-cert",
            )
        }

        fn uninstall_cert(&self, cert_path: &Path) -> anyhow::Result<()> {
            run(
                Command::new("security")
                    .arg("remove-trusted-cert")
                    .arg(cert_path),
                "security remove-trusted-cert",
            )?;
            let keychain = login_keychain()?;
            run(
                Command::new("security")
                    .args(["delete-certificate", "-c", CA_COMMON_NAME])
                    .arg(&keychain),
                "security delete-certificate",
            )
        }

        fn verify_cert(&self, cert_path: &Path) -> anyhow::Result<()> {
            run(
                Command::new("security")
                    .args(["verify-cert", "-c"])
                    .arg(cert_path),
                "security verify-cert",
            )
        }
    }

    fn login_keychain() -> anyhow::Result<PathBuf> {
        let Some(home) = env::var_os("HOME") else {
            bail!("HOME is not set; cannot locate the login keychain");
        };
        Ok(Path::new(&home).join(LOGIN_KEYCHAIN))
    }

    /// Enabled network services; disabled ones are listed with a leading `*`.
    fn network_services() -> anyhow::Result<Vec<String>> {
        let output = Command::new("networksetup")
            .arg("-listallnetworkservices")
            .output()
            .context("run `networksetup -listallnetworkservices`")?;
        ensure_success(&output, "networksetup -listallnetworkservices")?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .skip(1)
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('*'))
            .map(str::to_owned)
            .collect())
    }

    fn run(command: &mut Command, label: &str) -> anyhow::Result<()> {
        let output = command.output().with_context(|| format!("run `{label}`"))?;
        ensure_success(&output, label)
    }

    fn ensure_success(output: &Output, label: &str) -> anyhow::Result<()> {
        if output.status.success() {
            return Ok(());
        }
        bail!("`{label}` failed ({})", command_failure_summary(output))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        process::{Command, Output},
    };

    use super::{OsEnrollment, Unsupported, command_failure_summary, equal_url};

    #[test]
    fn equal_url_ignores_case_whitespace_and_trailing_slash() {
        assert!(equal_url(
            " http://127.0.0.1:9590/proxy.pac/ ",
            "HTTP://127.0.0.1:9590/proxy.pac"
        ));
        assert!(!equal_url(
            "http://127.0.0.1:9590/proxy.pac",
            "http://127.0.0.1:9591/proxy.pac"
        ));
    }

    #[test]
    fn unsupported_platform_refuses_mutations() {
        let os = Unsupported;
        assert!(!os.supported());
        assert!(os.install_os_proxy("http://127.0.0.1:9590/proxy.pac").is_err());
        assert!(os.install_cert(Path::new("/tmp/fingertip.crt")).is_err());
        os.uninstall_os_proxy("http://127.0.0.1:9590/proxy.pac")
            .expect("uninstall is a no-op");
        os.uninstall_cert(Path::new("/tmp/fingertip.crt"))
            .expect("uninstall is a no-op");
    }

    #[cfg(unix)]
    #[test]
    fn failure_summary_prefers_stderr_then_exit_code() {
        let output: Output = Command::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .output()
            .expect("sh should run");
        assert_eq!(command_failure_summary(&output), "broken");

        let output: Output = Command::new("sh")
            .args(["-c", "exit 4"])
            .output()
            .expect("sh should run");
        assert_eq!(command_failure_summary(&output), "exit code 4");
    }
}
