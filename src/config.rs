// Server configuration.
//
// Values come from built-in defaults, then an optional TOML file, then command line flags, each
// layer overriding the previous one. The resulting ServerConfig is validated once at startup and
// shared read-only with every session.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Well-known TFTP port.
pub const DEFAULT_PORT: u16 = 69;

pub const DEFAULT_ROOT: &str = "/srv/tftp";

/// Consecutive wait lengths, in seconds, before a transfer is abandoned.
pub const DEFAULT_TIMEOUTS: [u64; 3] = [1, 3, 8];

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to listen on. Session sockets bind to the same address.
    pub host: IpAddr,

    pub port: u16,

    /// Directory files are served from and written to. Canonical after [`ServerConfig::validate`].
    pub tftp_root: PathBuf,

    /// When false every write request is refused.
    pub writable: bool,

    /// How long to wait for a reply, indexed by the number of retransmissions so far. Running off
    /// the end abandons the transfer.
    pub timeouts: Vec<Duration>,

    /// Inclusive range session sockets pick their port from. `None` lets the OS choose.
    pub port_range: Option<(u16, u16)>,

    /// Unprivileged user to switch to once the listening socket is bound.
    pub user: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            tftp_root: PathBuf::from(DEFAULT_ROOT),
            writable: true,
            timeouts: DEFAULT_TIMEOUTS.iter().map(|s| Duration::from_secs(*s)).collect(),
            port_range: None,
            user: None,
        }
    }
}

/// On-disk layout of the configuration file.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    pub tftp_root: Option<PathBuf>,
    pub writable: Option<bool>,
    pub timeouts: Option<Vec<u64>>,
    pub port_range: Option<(u16, u16)>,
    pub user: Option<String>,
}

impl ConfigFile {
    pub fn parse(contents: &str) -> Result<ConfigFile> {
        toml::from_str(contents).context("Failed to parse configuration")
    }

    pub fn load(path: &Path) -> Result<ConfigFile> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("In configuration file {}", path.display()))
    }
}

impl ServerConfig {
    /// Overrides every value the file sets.
    pub fn apply_file(&mut self, file: ConfigFile) {
        let s = file.server;
        if let Some(host) = s.host {
            self.host = host;
        }
        if let Some(port) = s.port {
            self.port = port;
        }
        if let Some(root) = s.tftp_root {
            self.tftp_root = root;
        }
        if let Some(writable) = s.writable {
            self.writable = writable;
        }
        if let Some(timeouts) = s.timeouts {
            self.timeouts = timeouts.into_iter().map(Duration::from_secs).collect();
        }
        if s.port_range.is_some() {
            self.port_range = s.port_range;
        }
        if s.user.is_some() {
            self.user = s.user;
        }
    }

    /// Checks the values for consistency and canonicalizes the root directory.
    pub fn validate(&mut self) -> Result<()> {
        if self.timeouts.is_empty() {
            bail!("At least one timeout is required");
        }
        if self.timeouts.iter().any(|t| t.is_zero()) {
            bail!("Timeouts must be greater than zero");
        }
        if let Some((lo, hi)) = self.port_range {
            if lo == 0 || lo > hi {
                bail!("Invalid transfer port range {lo}-{hi}");
            }
        }

        let root = &self.tftp_root;
        if !root.exists() {
            bail!("The TFTP root does not exist: {}", root.display());
        }
        if !root.is_dir() {
            bail!("The TFTP root must be a directory: {}", root.display());
        }
        self.tftp_root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve TFTP root {}", root.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 69);
        assert!(config.writable);
        assert_eq!(
            config.timeouts,
            vec![Duration::from_secs(1), Duration::from_secs(3), Duration::from_secs(8)]
        );
        assert_eq!(config.port_range, None);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = ConfigFile::parse(
            r#"
            [server]
            port = 6969
            tftp_root = "/var/lib/tftpboot"
            writable = false
            timeouts = [2, 4]
            port_range = [50000, 50100]
            "#,
        )
        .unwrap();

        let mut config = ServerConfig::default();
        config.apply_file(file);
        assert_eq!(config.port, 6969);
        assert_eq!(config.tftp_root, PathBuf::from("/var/lib/tftpboot"));
        assert!(!config.writable);
        assert_eq!(config.timeouts, vec![Duration::from_secs(2), Duration::from_secs(4)]);
        assert_eq!(config.port_range, Some((50000, 50100)));
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_empty_file_changes_nothing() {
        let mut config = ServerConfig::default();
        config.apply_file(ConfigFile::parse("").unwrap());
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_bad_file_values_rejected() {
        assert!(ConfigFile::parse("[server]\nport = \"sixty-nine\"").is_err());
        assert!(ConfigFile::parse("[server]\nwritable = \"maybe\"").is_err());
        assert!(ConfigFile::parse("[server]\nbogus = 1").is_err());
    }

    #[test]
    fn test_validate_canonicalizes_root() {
        let tmpdir = TempDir::new("root").unwrap();
        let mut config = ServerConfig {
            tftp_root: tmpdir.path().join("."),
            ..ServerConfig::default()
        };
        tokio_test::assert_ok!(config.validate());
        assert_eq!(config.tftp_root, tmpdir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let tmpdir = TempDir::new("root").unwrap();
        let base = ServerConfig {
            tftp_root: tmpdir.path().to_path_buf(),
            ..ServerConfig::default()
        };

        let mut missing_root = ServerConfig { tftp_root: tmpdir.path().join("missing"), ..base.clone() };
        tokio_test::assert_err!(missing_root.validate());

        let file = tmpdir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        let mut file_root = ServerConfig { tftp_root: file, ..base.clone() };
        tokio_test::assert_err!(file_root.validate());

        let mut no_timeouts = ServerConfig { timeouts: vec![], ..base.clone() };
        tokio_test::assert_err!(no_timeouts.validate());

        let mut inverted = ServerConfig { port_range: Some((6000, 5000)), ..base.clone() };
        tokio_test::assert_err!(inverted.validate());
    }
}
