//! Daemon command-line surface.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use corelib::{ClusterConfig, Error, Result, WritePolicy, DEFAULT_VNODES};

#[derive(Parser, Debug, Clone)]
#[command(name = "flockd", about = "Distributed virtual-disk object store daemon")]
pub struct CliConfig {
    /// TCP port to listen on.
    #[arg(short = 'p', long, default_value_t = 7000)]
    pub port: u16,

    /// Address advertised to the other nodes.
    #[arg(short = 'y', long, default_value = "127.0.0.1")]
    pub myaddr: IpAddr,

    /// Cluster driver to ride on.
    #[arg(short = 'c', long, default_value = "local")]
    pub cluster: String,

    /// Failure-domain id; 0 means unzoned.
    #[arg(short = 'z', long, default_value_t = 0)]
    pub zone: u32,

    /// Ring positions to claim; 0 runs this node as a pure gateway.
    #[arg(short = 'g', long, default_value_t = DEFAULT_VNODES)]
    pub vnodes: u16,

    /// Advertised capacity in megabytes, 0 for unlimited.
    #[arg(short = 's', long, default_value_t = 0)]
    pub disk_space: u64,

    /// Log verbosity (trace, debug, info, warn, error).
    #[arg(short = 'l', long, default_value = "info")]
    pub loglevel: String,

    /// Complete writes from the page cache instead of fsyncing each one.
    #[arg(short = 'w', long)]
    pub write_cache: bool,

    /// What a replicated write needs before reporting success
    /// ("halt" or "degraded").
    #[arg(long, default_value = "halt")]
    pub write_policy: String,

    /// Base directory for objects, the epoch log, and logs.
    #[arg(value_name = "PATH", default_value = "/var/lib/flock")]
    pub dir: PathBuf,
}

impl CliConfig {
    pub fn cluster_config(&self) -> Result<ClusterConfig> {
        let write_policy: WritePolicy = self.write_policy.parse()?;
        Ok(ClusterConfig {
            write_policy,
            write_cache: self.write_cache,
            disk_space: self.disk_space.checked_mul(1024 * 1024).ok_or_else(|| {
                Error::InvalidParms(format!("disk space {} MB overflows", self.disk_space))
            })?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let config = CliConfig::parse_from(["flockd"]);
        assert_eq!(config.port, 7000);
        assert_eq!(config.cluster, "local");
        assert_eq!(config.vnodes, DEFAULT_VNODES);
        assert!(config.cluster_config().is_ok());
    }

    #[test]
    fn test_gateway_mode() {
        let config = CliConfig::parse_from(["flockd", "-g", "0", "/tmp/x"]);
        assert_eq!(config.vnodes, 0);
        assert_eq!(config.dir, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_bad_write_policy_rejected() {
        let config = CliConfig::parse_from(["flockd", "--write-policy", "yolo"]);
        assert!(config.cluster_config().is_err());
    }
}
