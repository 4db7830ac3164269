//! Command-line interface.
//!
//! Two modes:
//! - `tether start` runs the management panel plus the supervisor, driven
//!   by the persisted configuration file.
//! - the legacy flag form (`tether --hub URL --computer-id ID ...`) runs
//!   the supervisor directly from flags, without a config file or panel.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use tether_core::config::Config;
use tether_core::constants::DEFAULT_BROWSER_PORT;

/// tether - endpoint agent for Hub-driven remote control.
#[derive(Debug, Parser)]
#[command(
    name = "tether",
    version,
    about = "tether - endpoint agent bridging a Hub to this computer and browser"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Hub address, e.g. ws://localhost:50051 (legacy direct mode)
    #[arg(long = "hub", value_name = "URL")]
    pub hub: Option<String>,

    /// Computer identity, e.g. my-pc (legacy direct mode)
    #[arg(long = "computer-id", value_name = "ID")]
    pub computer_id: Option<String>,

    /// Computer description (legacy direct mode)
    #[arg(long = "computer-desc", value_name = "TEXT")]
    pub computer_desc: Option<String>,

    /// Browser identity, e.g. my-chrome (legacy direct mode)
    #[arg(long = "browser-id", value_name = "ID")]
    pub browser_id: Option<String>,

    /// Browser description (legacy direct mode)
    #[arg(long = "browser-desc", value_name = "TEXT")]
    pub browser_desc: Option<String>,

    /// Local port for the browser bridge (legacy direct mode)
    #[arg(long = "browser-port", default_value_t = DEFAULT_BROWSER_PORT)]
    pub browser_port: u16,

    /// Comma-separated allow-listed path prefixes (legacy direct mode)
    #[arg(long = "paths", value_name = "P1,P2,...")]
    pub paths: Option<String>,

    /// Bearer token echoed in the registration message
    #[arg(long = "token", value_name = "TOKEN")]
    pub token: Option<String>,

    /// Increase verbosity (can be repeated: -v, -vv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the management panel and the supervised connection
    Start {
        /// Configuration file path (default ~/.tether/config.yaml)
        #[arg(long = "config", value_name = "PATH")]
        config: Option<PathBuf>,

        /// Management panel port (default from config, then 19800)
        #[arg(long = "port", value_name = "N")]
        port: Option<u16>,
    },
}

impl Cli {
    /// Build the in-memory configuration for legacy direct mode.
    ///
    /// Requires `--hub` and at least one of `--computer-id`/`--browser-id`.
    pub fn legacy_config(&self) -> Result<Config, String> {
        let Some(hub) = self.hub.as_deref().filter(|s| !s.is_empty()) else {
            return Err("必须指定 --hub 参数".to_string());
        };
        let computer_id = self.computer_id.clone().unwrap_or_default();
        let browser_id = self.browser_id.clone().unwrap_or_default();
        if computer_id.is_empty() && browser_id.is_empty() {
            return Err("必须指定 --computer-id 或 --browser-id（至少一个）".to_string());
        }

        let mut cfg = Config::with_defaults();
        cfg.agent.address = hub.to_string();
        cfg.agent.token = self.token.clone().unwrap_or_default();
        cfg.computer.id = computer_id;
        cfg.computer.description = self.computer_desc.clone().unwrap_or_default();
        cfg.computer.allowed_paths = split_paths(self.paths.as_deref().unwrap_or(""));
        cfg.browser.id = browser_id;
        cfg.browser.description = self.browser_desc.clone().unwrap_or_default();
        cfg.browser.port = self.browser_port;
        Ok(cfg)
    }
}

/// Split a comma-separated path list, trimming whitespace and dropping
/// empty entries.
fn split_paths(paths: &str) -> Vec<String> {
    paths
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_start_subcommand() {
        let cli = Cli::parse_from(["tether", "start", "--config", "/tmp/c.yaml", "--port", "8080"]);
        match cli.command {
            Some(Command::Start { config, port }) => {
                assert_eq!(config, Some(PathBuf::from("/tmp/c.yaml")));
                assert_eq!(port, Some(8080));
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn legacy_requires_hub() {
        let cli = Cli::parse_from(["tether", "--computer-id", "pc"]);
        let err = cli.legacy_config().unwrap_err();
        assert!(err.contains("--hub"));
    }

    #[test]
    fn legacy_requires_a_role() {
        let cli = Cli::parse_from(["tether", "--hub", "ws://h:1"]);
        let err = cli.legacy_config().unwrap_err();
        assert!(err.contains("--computer-id"));
    }

    #[test]
    fn legacy_builds_full_config() {
        let cli = Cli::parse_from([
            "tether",
            "--hub",
            "ws://h:1",
            "--computer-id",
            "pc",
            "--browser-id",
            "chrome",
            "--browser-port",
            "20000",
            "--paths",
            " /tmp , /home/me ,",
            "--token",
            "t",
        ]);
        let cfg = cli.legacy_config().unwrap();
        assert_eq!(cfg.agent.address, "ws://h:1");
        assert_eq!(cfg.agent.token, "t");
        assert_eq!(cfg.computer.id, "pc");
        assert_eq!(
            cfg.computer.allowed_paths,
            vec!["/tmp".to_string(), "/home/me".to_string()]
        );
        assert_eq!(cfg.browser.id, "chrome");
        assert_eq!(cfg.browser.port, 20000);
        assert!(cfg.is_configured());
    }

    #[test]
    fn split_paths_handles_blanks() {
        assert!(split_paths("").is_empty());
        assert_eq!(split_paths("/a"), vec!["/a".to_string()]);
        assert_eq!(
            split_paths("/a, ,/b"),
            vec!["/a".to_string(), "/b".to_string()]
        );
    }
}
