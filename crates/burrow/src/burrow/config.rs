use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::burrow::{net, tunnel::pool::PoolLimits, tunnel::transport::parse_transport};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps BURROW_CONFIG into the flag value when unset, but keep the design's precedence
    // clear by treating it as "env" when present.
    if let Some(p) = std::env::var_os("BURROW_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    let meta = fs::metadata(&p);
    if let Ok(m) = meta {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("burrow.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["burrow.toml", "burrow.yaml", "burrow.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no burrow.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    // Linux: system-wide default.
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/burrow/burrow.toml"));
    }

    // Other OSes: per-user config dir.
    #[cfg(not(target_os = "linux"))]
    {
        use directories::ProjectDirs;

        let proj = ProjectDirs::from("dev", "burrow", "burrow")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("burrow.toml"))
    }
}

pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once (O_EXCL equivalent).
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc, path)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub control_addr: String,
    pub control_transports: Vec<String>,
    /// Empty disables the listener.
    pub http_addr: String,
    pub https_addr: String,
    pub admin_addr: String,
    pub server_domain: String,
    pub tls: Option<TlsConfig>,
    pub aes_secret: Option<String>,
    pub pool: PoolLimits,
    pub auth_url: Option<String>,
    pub notify: Option<NotifyConfig>,
    pub timeouts: Timeouts,
    pub max_header_bytes: usize,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn http_port(&self) -> Option<u16> {
        net::port_of(&self.http_addr)
    }

    /// HTTPS is served only when a certificate is configured.
    pub fn https_port(&self) -> Option<u16> {
        self.tls.as_ref()?;
        net::port_of(&self.https_addr)
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub url: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub handshake_timeout: Duration,
    pub sniff_timeout: Duration,
    /// Zero leaves idle control sessions open indefinitely.
    pub control_idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    control_addr: Option<String>,
    control_transports: Option<Vec<String>>,
    http_addr: Option<String>,
    https_addr: Option<String>,
    admin_addr: Option<String>,
    #[serde(default)]
    server_domain: String,
    tls: Option<FileTls>,
    aes: Option<FileAes>,
    pool: Option<FilePool>,
    auth: Option<FileAuth>,
    notify: Option<FileNotify>,
    timeouts: Option<FileTimeouts>,
    #[serde(default)]
    max_header_bytes: i64,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
struct FileTls {
    #[serde(default)]
    cert_file: String,
    #[serde(default)]
    key_file: String,
}

#[derive(Debug, Deserialize)]
struct FileAes {
    #[serde(default)]
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct FilePool {
    max_idle_pipes: Option<i64>,
    max_streams: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileAuth {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct FileNotify {
    #[serde(default)]
    url: String,
    #[serde(default)]
    key: String,
}

#[derive(Debug, Deserialize)]
struct FileTimeouts {
    handshake_timeout_ms: Option<i64>,
    sniff_timeout_ms: Option<i64>,
    control_idle_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    Duration::from_millis(v.map(|n| n.max(0) as u64).unwrap_or(default))
}

fn pool_limit(v: Option<i64>, default: i64, key: &str) -> anyhow::Result<usize> {
    let n = v.unwrap_or(default);
    usize::try_from(n).map_err(|_| anyhow::anyhow!("config: pool.{key} must be a non-negative integer, got {n}"))
}

/// Relative certificate paths are taken relative to the config file.
fn resolve_relative(config_path: &Path, p: &str) -> PathBuf {
    let p = PathBuf::from(p);
    if p.is_absolute() {
        return p;
    }
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(p),
        _ => p,
    }
}

impl Config {
    fn from_file_config(fc: FileConfig, config_path: &Path) -> anyhow::Result<Config> {
        let mut cfg = Config {
            control_addr: fc.control_addr.as_deref().map(str::trim).unwrap_or(":8888").to_string(),
            control_transports: vec![],
            http_addr: fc.http_addr.as_deref().map(str::trim).unwrap_or(":80").to_string(),
            https_addr: fc.https_addr.as_deref().map(str::trim).unwrap_or(":443").to_string(),
            admin_addr: fc.admin_addr.as_deref().map(str::trim).unwrap_or(":8080").to_string(),
            server_domain: fc.server_domain.trim().trim_matches('.').to_ascii_lowercase(),
            tls: None,
            aes_secret: fc.aes.as_ref().and_then(|a| non_empty(Some(&a.secret_key))),
            pool: PoolLimits {
                max_idle_pipes: pool_limit(
                    fc.pool.as_ref().and_then(|p| p.max_idle_pipes),
                    4,
                    "max_idle_pipes",
                )?,
                max_streams: pool_limit(
                    fc.pool.as_ref().and_then(|p| p.max_streams),
                    6,
                    "max_streams",
                )?,
            },
            auth_url: fc.auth.as_ref().and_then(|a| non_empty(Some(&a.url))),
            notify: None,
            timeouts: Timeouts {
                handshake_timeout: millis(
                    fc.timeouts.as_ref().and_then(|t| t.handshake_timeout_ms),
                    10_000,
                ),
                sniff_timeout: millis(fc.timeouts.as_ref().and_then(|t| t.sniff_timeout_ms), 20_000),
                control_idle_timeout: millis(
                    fc.timeouts.as_ref().and_then(|t| t.control_idle_timeout_ms),
                    0,
                ),
            },
            max_header_bytes: fc.max_header_bytes.max(0) as usize,
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        if cfg.max_header_bytes == 0 {
            cfg.max_header_bytes = 64 * 1024;
        }
        if cfg.control_addr.is_empty() {
            anyhow::bail!("config: control_addr must not be empty");
        }
        if cfg.pool.max_streams == 0 {
            anyhow::bail!("config: pool.max_streams must be at least 1");
        }

        // --- Control transports ---
        let transports = fc
            .control_transports
            .unwrap_or_else(|| vec!["tcp".into(), "udp".into()]);
        for t in &transports {
            let t = parse_transport(t).context("config: control_transports")?;
            if !cfg.control_transports.contains(&t) {
                cfg.control_transports.push(t);
            }
        }
        if cfg.control_transports.is_empty() {
            anyhow::bail!("config: control_transports must name at least one transport");
        }

        // --- TLS ---
        if let Some(t) = &fc.tls {
            let (cert, key) = (t.cert_file.trim(), t.key_file.trim());
            match (cert.is_empty(), key.is_empty()) {
                (true, true) => {}
                (false, false) => {
                    cfg.tls = Some(TlsConfig {
                        cert_file: resolve_relative(config_path, cert),
                        key_file: resolve_relative(config_path, key),
                    });
                }
                _ => anyhow::bail!("config: tls requires both cert_file and key_file (or neither)"),
            }
        }

        // --- Notify ---
        if let Some(n) = &fc.notify {
            if let Some(url) = non_empty(Some(&n.url)) {
                cfg.notify = Some(NotifyConfig {
                    url,
                    key: n.key.trim().to_string(),
                });
            }
        }

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(l.level.as_deref()) {
                cfg.logging.level = level;
            }
            if let Some(fmt) = non_empty(l.format.as_deref()) {
                cfg.logging.format = fmt;
            }
            if let Some(out) = non_empty(l.output.as_deref()) {
                cfg.logging.output = out;
            }
            cfg.logging.add_source = l.add_source;
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Burrow configuration (auto-generated)
#
# This file was created because Burrow could not find a configuration file at
# the resolved config path. It is runnable without edits: tunnel clients connect
# to control_addr and publish HTTP tunnels on http_addr.
#
# Uncomment [tls] to enable the "tls" encryption mode and the HTTPS listener,
# and [aes] to enable the "aes" encryption mode.

control_addr = ":8888"
control_transports = ["tcp", "udp"]
http_addr = ":80"
https_addr = ":443"
admin_addr = ":8080"
server_domain = ""

# [tls]
# cert_file = "server.crt"
# key_file = "server.key"

# [aes]
# secret_key = "change-me"

[pool]
max_idle_pipes = 4
max_streams = 6

[timeouts]
handshake_timeout_ms = 10000
sniff_timeout_ms = 20000
control_idle_timeout_ms = 0

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Burrow configuration (auto-generated)
#
# This file was created because Burrow could not find a configuration file at
# the resolved config path. It is runnable without edits: tunnel clients connect
# to control_addr and publish HTTP tunnels on http_addr.
#
# Uncomment tls to enable the "tls" encryption mode and the HTTPS listener,
# and aes to enable the "aes" encryption mode.

control_addr: ":8888"
control_transports: ["tcp", "udp"]
http_addr: ":80"
https_addr: ":443"
admin_addr: ":8080"
server_domain: ""

# tls:
#   cert_file: "server.crt"
#   key_file: "server.key"

# aes:
#   secret_key: "change-me"

pool:
  max_idle_pipes: 4
  max_streams: 6

timeouts:
  handshake_timeout_ms: 10000
  sniff_timeout_ms: 20000
  control_idle_timeout_ms: 0

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;
