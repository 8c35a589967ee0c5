//! Run the HTTP upload API

use anyhow::Result;
use clap::Args;
use drivecheck_api_server::ServerConfig;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Args)]
pub struct ServeCommand {
    /// Bind address (overrides API_SERVER_ADDR)
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,

    /// YAML evaluation config (overrides DRIVECHECK_CONFIG)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Upload size limit in MiB (overrides DRIVECHECK_MAX_UPLOAD_MB)
    #[arg(long, value_name = "MB")]
    max_upload_mb: Option<u64>,
}

impl ServeCommand {
    pub async fn execute(self) -> Result<ExitCode> {
        let config = self.server_config(ServerConfig::from_env()?)?;
        drivecheck_api_server::run(config).await?;
        Ok(ExitCode::SUCCESS)
    }

    fn server_config(&self, mut config: ServerConfig) -> Result<ServerConfig> {
        if let Some(addr) = &self.addr {
            config.addr.clone_from(addr);
        }
        if let Some(path) = &self.config {
            config.evaluation_config = Some(path.clone());
        }
        if let Some(mb) = self.max_upload_mb {
            anyhow::ensure!(mb > 0, "--max-upload-mb must be positive");
            config.max_upload_bytes = mb * 1024 * 1024;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        cmd: ServeCommand,
    }

    fn parse(args: &[&str]) -> ServeCommand {
        let argv = std::iter::once("serve").chain(args.iter().copied());
        Harness::try_parse_from(argv).unwrap().cmd
    }

    #[test]
    fn test_flags_override_environment() {
        let config = parse(&["--addr", "127.0.0.1:9090", "--max-upload-mb", "8"])
            .server_config(ServerConfig::default())
            .unwrap();

        assert_eq!(config.addr, "127.0.0.1:9090");
        assert_eq!(config.max_upload_bytes, 8 * 1024 * 1024);
        assert_eq!(config.evaluation_config, None);
    }

    #[test]
    fn test_no_flags_keeps_environment() {
        let base = ServerConfig {
            addr: "10.0.0.1:80".to_string(),
            ..Default::default()
        };
        let config = parse(&[]).server_config(base.clone()).unwrap();
        assert_eq!(config, base);
    }

    #[test]
    fn test_zero_upload_limit_rejected() {
        assert!(parse(&["--max-upload-mb", "0"])
            .server_config(ServerConfig::default())
            .is_err());
    }
}
