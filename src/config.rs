use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context as _;
use serde::Deserialize;

use crate::ca;

pub const PROJECT_CONFIG_FILE_NAME: &str = "snoopproxy.toml";
pub const HOME_CONFIG_SUBPATH: &str = ".snoopproxy/config.toml";
pub const CERT_CACHE_SUBDIR: &str = "certs";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    pub storage: Option<StorageConfig>,
    pub logging: Option<LoggingConfig>,
    #[serde(skip)]
    source_path: Option<PathBuf>,
}

impl Config {
    /// Loads from `path`, or from the first discovered config file, or falls
    /// back to defaults when no file exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_path(path);
        }

        let cwd = env::current_dir().context("resolve current directory")?;
        let home = env::var_os("HOME").map(PathBuf::from);
        match discover_config_path(&cwd, home.as_deref()) {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
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

    pub fn ca_dir(&self) -> anyhow::Result<PathBuf> {
        ca::resolve_ca_dir(self.tls.ca_dir.as_deref())
    }

    pub fn cert_cache_dir(&self) -> anyhow::Result<PathBuf> {
        match self.tls.cert_cache_dir.as_ref() {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(self.ca_dir()?.join(CERT_CACHE_SUBDIR)),
        }
    }

    pub fn storage_path(&self) -> Option<PathBuf> {
        self.storage
            .as_ref()
            .and_then(|storage| storage.path.as_deref())
            .map(expand_tilde)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_admin_listen")]
    pub admin_listen: SocketAddr,
    #[serde(default = "default_true")]
    pub admin_enabled: bool,
    pub upstream_timeout_ms: Option<u64>,
}

impl ProxyConfig {
    pub fn admin_listen_addr(&self) -> Option<SocketAddr> {
        self.admin_enabled.then_some(self.admin_listen)
    }

    pub fn upstream_timeout(&self) -> Option<Duration> {
        self.upstream_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_proxy_listen(),
            admin_listen: default_admin_listen(),
            admin_enabled: true,
            upstream_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub ca_dir: Option<PathBuf>,
    pub cert_cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn default_proxy_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_admin_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

fn default_true() -> bool {
    true
}

pub fn discover_config_path(cwd: &Path, home: Option<&Path>) -> Option<PathBuf> {
    let project = cwd.join(PROJECT_CONFIG_FILE_NAME);
    if project.is_file() {
        return Some(project);
    }

    let home_config = home?.join(HOME_CONFIG_SUBPATH);
    home_config.is_file().then_some(home_config)
}

pub(crate) fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match env::var_os("HOME") {
        Some(home) => Path::new(&home).join(rest),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path, time::Duration};

    use super::{
        Config, HOME_CONFIG_SUBPATH, LogFormat, PROJECT_CONFIG_FILE_NAME, discover_config_path,
    };
    use tempfile::tempdir;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").expect("empty config should parse");

        assert_eq!(config.proxy.listen.to_string(), "127.0.0.1:8080");
        assert_eq!(
            config.proxy.admin_listen_addr().map(|addr| addr.to_string()),
            Some("127.0.0.1:8000".to_owned())
        );
        assert_eq!(config.proxy.upstream_timeout(), None);
        assert!(config.storage_path().is_none());
        assert!(config.logging.is_none());
    }

    #[test]
    fn full_config_parses_every_section() {
        let config = Config::from_toml_str(
            r#"
[proxy]
listen = "0.0.0.0:9090"
admin_listen = "127.0.0.1:9091"
upstream_timeout_ms = 2500

[tls]
ca_dir = "/srv/snoop/ca"

[storage]
path = "/srv/snoop/interactions.db"

[logging]
level = "debug"
format = "pretty"
"#,
        )
        .expect("config should parse");

        assert_eq!(config.proxy.listen.port(), 9090);
        assert_eq!(
            config.proxy.upstream_timeout(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(
            config.cert_cache_dir().unwrap(),
            Path::new("/srv/snoop/ca/certs")
        );
        assert_eq!(
            config.storage_path().as_deref(),
            Some(Path::new("/srv/snoop/interactions.db"))
        );
        let logging = config.logging.expect("logging section");
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.format, Some(LogFormat::Pretty));
    }

    #[test]
    fn admin_listener_can_be_disabled() {
        let config = Config::from_toml_str(
            r#"
[proxy]
admin_enabled = false
"#,
        )
        .unwrap();
        assert_eq!(config.proxy.admin_listen_addr(), None);
    }

    #[test]
    fn explicit_cert_cache_dir_overrides_ca_subdir() {
        let config = Config::from_toml_str(
            r#"
[tls]
ca_dir = "/srv/ca"
cert_cache_dir = "/var/cache/snoop"
"#,
        )
        .unwrap();
        assert_eq!(
            config.cert_cache_dir().unwrap(),
            Path::new("/var/cache/snoop")
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
        .unwrap_err();
        assert!(
            format!("{err:#}").contains("unknown_key"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn discovery_prefers_project_then_home() {
        let sandbox = tempdir().expect("tempdir should be created");
        let project_dir = sandbox.path().join("project");
        let home_dir = sandbox.path().join("home");
        fs::create_dir_all(&project_dir).unwrap();
        fs::create_dir_all(home_dir.join(".snoopproxy")).unwrap();

        assert_eq!(discover_config_path(&project_dir, Some(&home_dir)), None);

        let home_config = home_dir.join(HOME_CONFIG_SUBPATH);
        fs::write(&home_config, "").unwrap();
        assert_eq!(
            discover_config_path(&project_dir, Some(&home_dir)),
            Some(home_config)
        );

        let project_config = project_dir.join(PROJECT_CONFIG_FILE_NAME);
        fs::write(&project_config, "").unwrap();
        assert_eq!(
            discover_config_path(&project_dir, Some(&home_dir)),
            Some(project_config)
        );
    }

    #[test]
    fn from_path_remembers_source() {
        let sandbox = tempdir().unwrap();
        let path = sandbox.path().join(PROJECT_CONFIG_FILE_NAME);
        fs::write(&path, "[proxy]\nlisten = \"127.0.0.1:0\"\n").unwrap();

        let config = Config::load(Some(&path)).expect("explicit config should load");
        assert_eq!(config.source_path(), Some(path.as_path()));
        assert_eq!(config.proxy.listen.port(), 0);
    }
}
