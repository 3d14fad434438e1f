use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow, bail};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, GeneralSubtree, IsCa, KeyPair, KeyUsagePurpose,
    NameConstraints,
};
use rsa::{
    RsaPrivateKey,
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding},
    pkcs8::EncodePrivateKey,
    rand_core::OsRng,
};
use time::{Duration, OffsetDateTime};
use x509_parser::{parse_x509_certificate, pem::parse_x509_pem};

use crate::naming::{self, NamingPolicy};

pub const CERT_FILE_NAME: &str = "fingertip.crt";
pub const KEY_FILE_NAME: &str = "private.key";
pub const CA_COMMON_NAME: &str = "DNSSEC";

const CA_VALIDITY_DAYS: i64 = 365;
const RSA_KEY_BITS: usize = 2048;
const CERTIFICATE_PEM_LABEL: &str = "CERTIFICATE";
const FILE_MODE_RESTRICTED: u32 = 0o600;
const FILE_MODE_READABLE: u32 = 0o644;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaMaterialPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CaMaterialPaths {
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            cert_path: dir.join(CERT_FILE_NAME),
            key_path: dir.join(KEY_FILE_NAME),
        }
    }
}

/// CA material parsed back from disk.
#[derive(Debug, Clone)]
pub struct LoadedAuthority {
    pub paths: CaMaterialPaths,
    pub certificate_pem: String,
    pub certificate_der: Vec<u8>,
    pub not_after: OffsetDateTime,
    pub private_key: RsaPrivateKey,
}

/// Owns the CA certificate and key files of one application directory.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    paths: CaMaterialPaths,
    permitted: Vec<String>,
    excluded: Vec<String>,
    constrained: bool,
}

impl CertificateAuthority {
    pub fn new(dir: &Path, policy: &dyn NamingPolicy) -> Self {
        Self {
            paths: CaMaterialPaths::from_dir(dir),
            permitted: naming::permitted_suffixes(policy),
            excluded: naming::skipped_names(policy),
            constrained: naming::has_constraints(policy),
        }
    }

    pub fn paths(&self) -> &CaMaterialPaths {
        &self.paths
    }

    /// Returns the current material when it is still valid, otherwise writes a fresh CA.
    pub fn get_or_create(&self) -> anyhow::Result<CaMaterialPaths> {
        match self.load() {
            Ok(existing) if existing.not_after > OffsetDateTime::now_utc() => {
                tracing::debug!(
                    cert = %self.paths.cert_path.display(),
                    not_after = %existing.not_after,
                    "reusing CA certificate"
                );
                return Ok(self.paths.clone());
            }
            Ok(existing) => {
                tracing::info!(not_after = %existing.not_after, "CA certificate expired; regenerating");
            }
            Err(err) => {
                tracing::info!("CA material unusable ({err:#}); generating a new authority");
            }
        }
        self.regenerate()
    }

    pub fn regenerate(&self) -> anyhow::Result<CaMaterialPaths> {
        let now = OffsetDateTime::now_utc();
        self.generate(now, now + Duration::days(CA_VALIDITY_DAYS))
    }

    /// Parses the certificate and key files and checks that they belong together.
    pub fn load(&self) -> anyhow::Result<LoadedAuthority> {
        let cert_path = &self.paths.cert_path;
        let key_path = &self.paths.key_path;
        let certificate_pem = fs::read_to_string(cert_path)
            .with_context(|| format!("read CA certificate {}", cert_path.display()))?;
        let key_pem = fs::read_to_string(key_path)
            .with_context(|| format!("read CA private key {}", key_path.display()))?;

        let (_, pem_block) = parse_x509_pem(certificate_pem.as_bytes()).map_err(|err| {
            anyhow!("parse CA certificate PEM {}: {err}", cert_path.display())
        })?;
        if pem_block.label != CERTIFICATE_PEM_LABEL {
            bail!(
                "parse CA certificate PEM {}: expected {CERTIFICATE_PEM_LABEL} block, got {}",
                cert_path.display(),
                pem_block.label
            );
        }
        let (_, certificate) = parse_x509_certificate(&pem_block.contents).map_err(|err| {
            anyhow!(
                "parse CA certificate DER payload {}: {err}",
                cert_path.display()
            )
        })?;

        let private_key = RsaPrivateKey::from_pkcs1_pem(&key_pem).map_err(|err| {
            anyhow!("parse CA private key PEM {}: {err}", key_path.display())
        })?;
        let public_key_der = private_key
            .to_public_key()
            .to_pkcs1_der()
            .map_err(|err| anyhow!("encode CA public key: {err}"))?;
        let cert_public_key = certificate
            .tbs_certificate
            .subject_pki
            .subject_public_key
            .data
            .as_ref();
        if cert_public_key != public_key_der.as_bytes() {
            bail!(
                "CA certificate {} and private key {} do not match",
                cert_path.display(),
                key_path.display()
            );
        }
        let not_after = certificate.validity().not_after.to_datetime();

        Ok(LoadedAuthority {
            paths: self.paths.clone(),
            certificate_pem,
            certificate_der: pem_block.contents,
            not_after,
            private_key,
        })
    }

    fn generate(
        &self,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> anyhow::Result<CaMaterialPaths> {
        let name_constraints = self.name_constraints()?;
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|err| anyhow!("generate CA private key: {err}"))?;
        let signing_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| anyhow!("encode CA private key for signing: {err}"))?;
        let key_pair =
            KeyPair::from_pem(&signing_pem).context("load CA private key for signing")?;

        let mut params =
            CertificateParams::new(Vec::<String>::new()).context("initialize CA certificate parameters")?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, CA_COMMON_NAME);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        params.not_before = not_before;
        params.not_after = not_after;
        params.name_constraints = Some(name_constraints);

        let cert = params
            .self_signed(&key_pair)
            .context("self-sign CA certificate")?;
        let key_pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|err| anyhow!("encode CA private key: {err}"))?;

        write_file_with_mode(
            &self.paths.cert_path,
            cert.pem().as_bytes(),
            FILE_MODE_READABLE,
        )?;
        write_file_with_mode(&self.paths.key_path, key_pem.as_bytes(), FILE_MODE_RESTRICTED)?;

        tracing::info!(
            cert = %self.paths.cert_path.display(),
            %not_after,
            "generated CA certificate"
        );
        Ok(self.paths.clone())
    }

    /// A system-trusted root must never be able to sign arbitrary names.
    fn name_constraints(&self) -> anyhow::Result<NameConstraints> {
        if !self.constrained {
            bail!(
                "naming policy provides no name constraints; refusing to generate an unconstrained CA"
            );
        }
        let subtrees = |names: &[String]| -> Vec<GeneralSubtree> {
            names
                .iter()
                .map(|name| GeneralSubtree::DnsName(name.clone()))
                .collect()
        };
        Ok(NameConstraints {
            permitted_subtrees: subtrees(&self.permitted),
            excluded_subtrees: subtrees(&self.excluded),
        })
    }
}

/// Replaces `path` with `contents`, creating it with `mode` so stale permissions never survive.
fn write_file_with_mode(path: &Path, contents: &[u8], mode: u32) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create parent directory {}", parent.display()))?;
    }
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("remove existing file {}", path.display()))?;
    }

    let mut file = create_file_with_mode(path, mode)?;
    file.write_all(contents)
        .with_context(|| format!("write file {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync file {}", path.display()))?;
    Ok(())
}

fn create_file_with_mode(path: &Path, mode: u32) -> anyhow::Result<fs::File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;

        let mut opts = fs::OpenOptions::new();
        opts.create_new(true).write(true).mode(mode);
        opts.open(path)
            .with_context(|| format!("create file {}", path.display()))
    }

    #[cfg(not(unix))]
    {
        let _ = mode;
        let mut opts = fs::OpenOptions::new();
        opts.create_new(true).write(true);
        opts.open(path)
            .with_context(|| format!("create file {}", path.display()))
    }
}
