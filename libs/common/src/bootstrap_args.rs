//! Common command-line arguments for services
//!
//! Services flatten [`ServiceArgs`] into their own clap parser.

use std::path::PathBuf;

use clap::Args;

use crate::logging::LogConfig;

/// Common service startup arguments
#[derive(Debug, Clone, Args)]
pub struct ServiceArgs {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Directory for daily-rolling log files
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Write file logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Disable colored output (useful for log files)
    #[arg(long)]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

impl Default for ServiceArgs {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            log_json: false,
            no_color: false,
            validate: false,
        }
    }
}

impl ServiceArgs {
    /// Logging configuration for `service_name`
    pub fn log_config(&self, service_name: &str) -> LogConfig {
        LogConfig {
            service_name: service_name.to_string(),
            level: self.log_level.clone(),
            log_dir: self.log_dir.clone(),
            enable_json: self.log_json,
            ansi: !self.no_color,
            ..Default::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        common: ServiceArgs,
    }

    #[test]
    fn test_default_args() {
        let args = ServiceArgs::default();
        assert_eq!(args.log_level, "info");
        assert!(!args.validate);
        assert!(args.log_dir.is_none());
    }

    #[test]
    fn test_log_config_from_args() {
        let args = ServiceArgs {
            log_level: "pollsrv=debug,warn".to_string(),
            log_json: true,
            no_color: true,
            ..Default::default()
        };
        let config = args.log_config("pollsrv");
        assert_eq!(config.service_name, "pollsrv");
        assert_eq!(config.level, "pollsrv=debug,warn");
        assert!(config.enable_json);
        assert!(!config.ansi);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_flattened_flags() {
        let cli = TestCli::try_parse_from([
            "svc",
            "--log-level",
            "debug",
            "--log-dir",
            "/var/log/svc",
            "--no-color",
            "--validate",
        ])
        .unwrap();
        assert!(cli.common.validate);

        let log = cli.common.log_config("svc");
        assert_eq!(log.level, "debug");
        assert_eq!(log.log_dir, Some(PathBuf::from("/var/log/svc")));
        assert!(!log.ansi);
    }
}
