use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogLevel> for tracing::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Serve the hybrid online store over HTTP
    Serve {
        /// Specify a host for the server
        #[arg(short = 'n', long = "host", default_value = "127.0.0.1")]
        host: String,
        /// Specify a port for the server
        #[arg(short = 'p', long = "port", default_value_t = 6566)]
        port: u16,
        /// path to TLS certificate private key. You need to pass --cert as well to start server
        /// in TLS mode
        #[arg(short='k', long="key", default_value = None)]
        key: Option<String>,
        /// path to TLS certificate public key. You need to pass --key as well to start server
        /// in TLS mode
        #[arg(short='c', long="cert", default_value = None)]
        cert: Option<String>,
        /// Enable the Metrics Server
        #[arg(short = 'm', long = "metrics", default_value_t = false)]
        metrics_enabled: bool,
    },
    /// Connect every configured backend, run its health check and print the routing of
    /// each feature view
    Check,
    /// Drop the stored data of every configured feature view and close all backends
    Teardown,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CliOptions {
    #[arg(short = 'c', long = "chdir", default_value = None)]
    /// Switch to a different feature repository directory before executing the given subcommand.
    /// Can also be set via the HYBRID_STORE_REPO_DIR environment variable.
    pub chdir: Option<String>,
    /// The logging level. Case-insensitive.
    #[arg(
        value_enum,
        long = "log-level",
        ignore_case = true,
        default_value = "info"
    )]
    pub log_level: LogLevel,
    /// Override the path of the feature_store.yaml file, relative to the repository directory.
    /// Can also be set via the HYBRID_STORE_YAML_FILE_PATH environment variable
    #[arg(short='f', long="feature-store-yaml", default_value = None)]
    pub feature_store_yaml: Option<String>,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serve_defaults() {
        let opts = CliOptions::parse_from(["hybrid-store", "serve"]);
        assert_eq!(opts.log_level, LogLevel::Info);
        match opts.command {
            CliCommand::Serve {
                host,
                port,
                key,
                cert,
                metrics_enabled,
            } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 6566);
                assert!(key.is_none() && cert.is_none());
                assert!(!metrics_enabled);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parse_global_options() {
        let opts = CliOptions::parse_from([
            "hybrid-store",
            "--chdir",
            "/repo",
            "--log-level",
            "DEBUG",
            "-f",
            "custom.yaml",
            "check",
        ]);
        assert_eq!(opts.chdir.as_deref(), Some("/repo"));
        assert_eq!(opts.log_level, LogLevel::Debug);
        assert_eq!(opts.feature_store_yaml.as_deref(), Some("custom.yaml"));
        assert!(matches!(opts.command, CliCommand::Check));
    }
}
