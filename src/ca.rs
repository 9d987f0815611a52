use std::{
    collections::HashMap,
    env, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context, anyhow, bail};
use rand::{TryRngCore, rngs::OsRng};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use x509_parser::{parse_x509_certificate, pem::parse_x509_pem};

use crate::config::expand_tilde;

pub const DEFAULT_CA_SUBDIR: &str = ".snoopproxy/ca";
pub const CA_CERT_FILE_NAME: &str = "cert.pem";
pub const CA_KEY_FILE_NAME: &str = "key.pem";
pub const LEAF_CERT_EXTENSION: &str = "crt";
pub const LEAF_KEY_EXTENSION: &str = "key";

const ROOT_CA_COMMON_NAME: &str = "snoopproxy Local Root CA";
const SERIAL_NUMBER_BYTES: usize = 16;
const DIR_MODE_RESTRICTED: u32 = 0o700;
const FILE_MODE_RESTRICTED: u32 = 0o600;
const FILE_MODE_READABLE: u32 = 0o644;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaMaterialPaths {
    pub ca_dir: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CaMaterialPaths {
    fn from_dir(ca_dir: &Path) -> Self {
        Self {
            ca_dir: ca_dir.to_path_buf(),
            cert_path: ca_dir.join(CA_CERT_FILE_NAME),
            key_path: ca_dir.join(CA_KEY_FILE_NAME),
        }
    }
}

/// A leaf certificate and key on disk, ready to be loaded by a TLS acceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCert {
    pub hostname: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// `false` when both files were already cached.
    pub generated: bool,
}

/// Issues leaf certificates signed by the local root CA and caches them as
/// `<cache_dir>/<host>.crt` / `<cache_dir>/<host>.key`.
///
/// The check-then-generate sequence runs under a per-hostname lock, so
/// concurrent first requests for one host produce a single key pair.
pub struct CertIssuer {
    issuer: Issuer<'static, KeyPair>,
    cache_dir: PathBuf,
    host_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for CertIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertIssuer")
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl CertIssuer {
    pub fn from_ca_dir(ca_dir: &Path, cache_dir: &Path) -> anyhow::Result<Self> {
        let paths = ca_material_paths(ca_dir);
        Self::from_ca_files(&paths.cert_path, &paths.key_path, cache_dir)
    }

    pub fn from_ca_files(
        cert_path: &Path,
        key_path: &Path,
        cache_dir: &Path,
    ) -> anyhow::Result<Self> {
        validate_ca_material(cert_path, key_path)?;

        let ca_cert_pem = fs::read_to_string(cert_path)
            .with_context(|| format!("read CA certificate {}", cert_path.display()))?;
        let ca_key_pem = fs::read_to_string(key_path)
            .with_context(|| format!("read CA private key {}", key_path.display()))?;
        Self::from_ca_pem(&ca_cert_pem, &ca_key_pem, cache_dir)
    }

    pub fn from_ca_pem(
        ca_cert_pem: &str,
        ca_key_pem: &str,
        cache_dir: &Path,
    ) -> anyhow::Result<Self> {
        let key_pair =
            KeyPair::from_pem(ca_key_pem).context("parse CA private key for leaf issuance")?;
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, key_pair)
            .context("parse CA certificate for leaf issuance")?;

        fs::create_dir_all(cache_dir)
            .with_context(|| format!("create certificate cache dir {}", cache_dir.display()))?;
        set_dir_permissions(cache_dir, DIR_MODE_RESTRICTED)?;

        Ok(Self {
            issuer,
            cache_dir: cache_dir.to_path_buf(),
            host_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Blocking: may sign a certificate and write two files. Async callers
    /// should run it on the blocking pool.
    pub fn issue_for(&self, hostname: &str) -> anyhow::Result<IssuedCert> {
        let hostname = normalize_leaf_hostname(hostname)?;
        let (cert_path, key_path) = self.leaf_paths(&hostname);

        let host_lock = self.host_lock(&hostname);
        let _guard = host_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if cert_path.is_file() && key_path.is_file() {
            return Ok(IssuedCert {
                hostname,
                cert_path,
                key_path,
                generated: false,
            });
        }

        let (cert_pem, key_pem) = self.sign_leaf(&hostname)?;
        // Certificate last: its presence marks a complete pair.
        write_file_atomically(&key_path, key_pem.as_bytes(), FILE_MODE_RESTRICTED)?;
        write_file_atomically(&cert_path, cert_pem.as_bytes(), FILE_MODE_RESTRICTED)?;
        tracing::debug!(
            hostname = %hostname,
            cert_path = %cert_path.display(),
            "issued leaf certificate"
        );

        Ok(IssuedCert {
            hostname,
            cert_path,
            key_path,
            generated: true,
        })
    }

    fn leaf_paths(&self, hostname: &str) -> (PathBuf, PathBuf) {
        (
            self.cache_dir
                .join(format!("{hostname}.{LEAF_CERT_EXTENSION}")),
            self.cache_dir
                .join(format!("{hostname}.{LEAF_KEY_EXTENSION}")),
        )
    }

    fn host_lock(&self, hostname: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .host_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(hostname.to_owned()).or_default())
    }

    fn sign_leaf(&self, hostname: &str) -> anyhow::Result<(String, String)> {
        let mut params = CertificateParams::new(vec![hostname.to_owned()])
            .with_context(|| format!("initialize leaf certificate parameters for `{hostname}`"))?;
        params
            .distinguished_name
            .push(DnType::CommonName, hostname.to_owned());
        params.serial_number = Some(random_serial_number()?);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;

        let leaf_key =
            KeyPair::generate().with_context(|| format!("generate leaf key for `{hostname}`"))?;
        let cert = params
            .signed_by(&leaf_key, &self.issuer)
            .with_context(|| format!("sign leaf certificate for `{hostname}`"))?;

        Ok((cert.pem(), leaf_key.serialize_pem()))
    }
}

/// Uniform over `[0, 2^128)`.
fn random_serial_number() -> anyhow::Result<SerialNumber> {
    let mut bytes = [0u8; SERIAL_NUMBER_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("generate certificate serial number")?;
    Ok(SerialNumber::from_slice(&bytes))
}

fn normalize_leaf_hostname(hostname: &str) -> anyhow::Result<String> {
    let hostname = hostname.trim();
    if hostname.is_empty() {
        bail!("leaf certificate hostname must not be empty");
    }

    let mut normalized = if hostname.starts_with('[') && hostname.ends_with(']') {
        hostname[1..hostname.len() - 1].to_owned()
    } else {
        hostname.to_owned()
    };
    if let Some(stripped) = normalized.strip_suffix('.')
        && !stripped.is_empty()
    {
        normalized = stripped.to_owned();
    }
    if normalized.is_empty() {
        bail!("leaf certificate hostname must not be empty");
    }
    // The hostname doubles as a cache file name.
    if normalized.contains(['/', '\\', '\0']) || normalized == "." || normalized == ".." {
        bail!("leaf certificate hostname `{normalized}` is not a valid host");
    }

    Ok(normalized.to_ascii_lowercase())
}

pub fn default_ca_dir() -> anyhow::Result<PathBuf> {
    let Some(home) = env::var_os("HOME") else {
        bail!("cannot resolve CA directory: HOME is not set");
    };
    Ok(default_ca_dir_from_home(Path::new(&home)))
}

pub fn resolve_ca_dir(ca_dir_override: Option<&Path>) -> anyhow::Result<PathBuf> {
    match ca_dir_override {
        Some(path) => Ok(expand_tilde(path)),
        None => default_ca_dir(),
    }
}

pub fn ca_material_paths(ca_dir: &Path) -> CaMaterialPaths {
    CaMaterialPaths::from_dir(ca_dir)
}

pub fn generate_ca(ca_dir: &Path, force: bool) -> anyhow::Result<CaMaterialPaths> {
    let paths = ca_material_paths(ca_dir);
    if !force && (paths.cert_path.exists() || paths.key_path.exists()) {
        bail!(
            "CA material already exists at {}; pass `--force` to overwrite",
            ca_dir.display()
        );
    }

    fs::create_dir_all(ca_dir)
        .with_context(|| format!("create CA directory {}", ca_dir.display()))?;
    set_dir_permissions(ca_dir, DIR_MODE_RESTRICTED)?;

    let root_key = KeyPair::generate().context("generate root CA private key")?;
    let root_cert = root_ca_params()?
        .self_signed(&root_key)
        .context("self-sign root CA certificate")?;

    // Key first so a crash never leaves a certificate without its key.
    replace_file(
        &paths.key_path,
        root_key.serialize_pem().as_bytes(),
        force,
        FILE_MODE_RESTRICTED,
    )?;
    replace_file(
        &paths.cert_path,
        root_cert.pem().as_bytes(),
        force,
        FILE_MODE_READABLE,
    )?;
    tracing::info!(ca_dir = %ca_dir.display(), "generated root CA");

    Ok(paths)
}

fn root_ca_params() -> anyhow::Result<CertificateParams> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, ROOT_CA_COMMON_NAME);
    params.serial_number = Some(random_serial_number()?);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    Ok(params)
}

/// Checks that `cert_path` holds a CA certificate whose public key belongs
/// to the private key at `key_path`.
pub fn validate_ca_material(cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
    let missing: Vec<_> = [cert_path, key_path]
        .into_iter()
        .filter(|path| !path.is_file())
        .map(|path| path.display().to_string())
        .collect();
    if !missing.is_empty() {
        bail!(
            "root CA material not found ({}); run `snoopproxy ca generate` first",
            missing.join(", ")
        );
    }

    let key_pem = fs::read_to_string(key_path)
        .with_context(|| format!("read CA private key {}", key_path.display()))?;
    let key_pair = KeyPair::from_pem(&key_pem)
        .with_context(|| format!("CA private key {} is not a valid PEM key", key_path.display()))?;

    let cert_pem = fs::read(cert_path)
        .with_context(|| format!("read CA certificate {}", cert_path.display()))?;
    let public_key = ca_certificate_public_key(&cert_pem)
        .with_context(|| format!("CA certificate {}", cert_path.display()))?;

    if public_key != key_pair.public_key_raw() {
        bail!(
            "CA certificate {} and private key {} do not match",
            cert_path.display(),
            key_path.display()
        );
    }
    Ok(())
}

fn ca_certificate_public_key(cert_pem: &[u8]) -> anyhow::Result<Vec<u8>> {
    let (_, block) = parse_x509_pem(cert_pem).map_err(|err| anyhow!("invalid PEM: {err}"))?;
    if block.label != "CERTIFICATE" {
        bail!("expected a CERTIFICATE block, found {}", block.label);
    }
    let (_, certificate) =
        parse_x509_certificate(&block.contents).map_err(|err| anyhow!("invalid DER: {err}"))?;
    if !certificate.is_ca() {
        bail!("not a CA certificate");
    }
    Ok(certificate.public_key().subject_public_key.data.to_vec())
}

/// Copies the root certificate to `out_path` and returns that path.
pub fn export_ca_cert(ca_dir: &Path, out_path: &Path, force: bool) -> anyhow::Result<PathBuf> {
    let cert_path = ca_material_paths(ca_dir).cert_path;
    let cert_pem = match fs::read(&cert_path) {
        Ok(pem) => pem,
        Err(err) if err.kind() == io::ErrorKind::NotFound => bail!(
            "CA certificate not found at {}; run `snoopproxy ca generate` first",
            cert_path.display()
        ),
        Err(err) => {
            return Err(err).with_context(|| format!("read CA certificate {}", cert_path.display()));
        }
    };

    if let Some(parent) = out_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create parent directory {}", parent.display()))?;
    }
    replace_file(out_path, &cert_pem, force, FILE_MODE_READABLE)?;

    Ok(out_path.to_path_buf())
}

fn default_ca_dir_from_home(home: &Path) -> PathBuf {
    home.join(DEFAULT_CA_SUBDIR)
}

/// Creates `path`, refusing to clobber an existing file unless `force`.
fn replace_file(path: &Path, contents: &[u8], force: bool, mode: u32) -> anyhow::Result<()> {
    match (path.exists(), force) {
        (true, false) => bail!(
            "file {} already exists; pass `--force` to overwrite",
            path.display()
        ),
        (true, true) => fs::remove_file(path)
            .with_context(|| format!("remove existing file {}", path.display()))?,
        (false, _) => {}
    }
    write_new_file(path, contents, mode)
}

/// Writes to a uniquely named sibling and renames it over `path`.
fn write_file_atomically(path: &Path, contents: &[u8], mode: u32) -> anyhow::Result<()> {
    let mut suffix = [0u8; 8];
    OsRng
        .try_fill_bytes(&mut suffix)
        .context("generate temporary file suffix")?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid cache file path {}", path.display()))?;
    let staging = path.with_file_name(format!(
        ".{file_name}.{:016x}.partial",
        u64::from_be_bytes(suffix)
    ));

    let written = write_new_file(&staging, contents, mode).and_then(|()| {
        fs::rename(&staging, path)
            .with_context(|| format!("rename {} to {}", staging.display(), path.display()))
    });
    if written.is_err() {
        let _ = fs::remove_file(&staging);
    }
    written
}

fn write_new_file(path: &Path, contents: &[u8], mode: u32) -> anyhow::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options
        .open(path)
        .with_context(|| format!("create file {}", path.display()))?;
    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("write file {}", path.display()))
}

fn set_dir_permissions(path: &Path, mode: u32) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("set permissions on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}
