use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use snoopproxy::{ca, config::Config, logging};

#[derive(Debug, Parser)]
#[command(name = "snoopproxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the intercepting proxy and the admin API.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Manage the root certificate authority.
    Ca {
        #[command(subcommand)]
        action: CaCommand,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum CaCommand {
    /// Generate a root CA certificate and key.
    Generate {
        /// CA directory. Defaults to `~/.snoopproxy/ca`.
        #[arg(long)]
        ca_dir: Option<PathBuf>,
        /// Overwrite existing CA material.
        #[arg(long)]
        force: bool,
    },
    /// Copy the root CA certificate somewhere clients can import it from.
    Export {
        /// Destination path for the PEM certificate.
        #[arg(long)]
        out: PathBuf,
        /// CA directory. Defaults to `~/.snoopproxy/ca`.
        #[arg(long)]
        ca_dir: Option<PathBuf>,
        /// Overwrite the destination when it exists.
        #[arg(long)]
        force: bool,
    },
}

fn run_ca_command(command: CaCommand) -> anyhow::Result<String> {
    match command {
        CaCommand::Generate { ca_dir, force } => {
            let ca_dir = ca::resolve_ca_dir(ca_dir.as_deref())?;
            let paths = ca::generate_ca(&ca_dir, force)?;
            Ok(format!(
                "generated root CA\n  cert: {}\n  key:  {}",
                paths.cert_path.display(),
                paths.key_path.display()
            ))
        }
        CaCommand::Export { out, ca_dir, force } => {
            let ca_dir = ca::resolve_ca_dir(ca_dir.as_deref())?;
            let exported = ca::export_ca_cert(&ca_dir, &out, force)?;
            Ok(format!("exported root CA certificate to {}", exported.display()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let proxy = snoopproxy::proxy::serve(&config).await?;
            eprintln!(
                "{}",
                startup_summary(&config, proxy.listen_addr, proxy.admin_listen_addr)
            );
            tokio::signal::ctrl_c().await?;
            proxy.shutdown().await;
        }
        Command::Ca { action } => {
            println!("{}", run_ca_command(action)?);
        }
    }

    Ok(())
}

fn startup_summary(
    config: &Config,
    proxy_listen_addr: SocketAddr,
    admin_listen_addr: Option<SocketAddr>,
) -> String {
    let admin_listen_addr = admin_listen_addr
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "disabled".to_owned());
    let storage = config
        .storage_path()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "in-memory".to_owned());
    let ca_dir = config
        .ca_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|_| "unresolved".to_owned());
    let config_source = config
        .source_path()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "defaults".to_owned());

    format!(
        "startup config: proxy_listen={proxy_listen_addr}, admin_listen={admin_listen_addr}, storage={storage}, ca_dir={ca_dir}, config={config_source}"
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{CaCommand, Cli, Command, run_ca_command, startup_summary};
    use clap::Parser;
    use snoopproxy::config::Config;
    use tempfile::tempdir;

    #[test]
    fn serve_parses_without_flags() {
        let cli = Cli::try_parse_from(["snoopproxy", "serve"]).expect("cli parse should succeed");
        match cli.command {
            Command::Serve { config, log_level } => {
                assert_eq!(config, None);
                assert_eq!(log_level, None);
            }
            other => panic!("expected serve command, got {other:?}"),
        }
    }

    #[test]
    fn serve_parses_config_and_log_level() {
        let cli = Cli::try_parse_from([
            "snoopproxy",
            "serve",
            "--config",
            "custom.toml",
            "--log-level",
            "debug",
        ])
        .expect("cli parse should succeed");
        match cli.command {
            Command::Serve { config, log_level } => {
                assert_eq!(config, Some(PathBuf::from("custom.toml")));
                assert_eq!(log_level.as_deref(), Some("debug"));
            }
            other => panic!("expected serve command, got {other:?}"),
        }
    }

    #[test]
    fn ca_export_requires_out() {
        assert!(Cli::try_parse_from(["snoopproxy", "ca", "export"]).is_err());

        let cli = Cli::try_parse_from(["snoopproxy", "ca", "export", "--out", "root.pem", "--force"])
            .expect("cli parse should succeed");
        match cli.command {
            Command::Ca { action } => assert_eq!(
                action,
                CaCommand::Export {
                    out: PathBuf::from("root.pem"),
                    ca_dir: None,
                    force: true,
                }
            ),
            other => panic!("expected ca command, got {other:?}"),
        }
    }

    #[test]
    fn ca_generate_then_export() {
        let temp_dir = tempdir().unwrap();
        let ca_dir = temp_dir.path().join("ca");
        let out = temp_dir.path().join("exported.pem");

        let generated = run_ca_command(CaCommand::Generate {
            ca_dir: Some(ca_dir.clone()),
            force: false,
        })
        .expect("generate should succeed");
        assert!(generated.contains("generated root CA"), "{generated}");

        let exported = run_ca_command(CaCommand::Export {
            out: out.clone(),
            ca_dir: Some(ca_dir.clone()),
            force: false,
        })
        .expect("export should succeed");
        assert!(exported.contains("exported.pem"), "{exported}");
        assert_eq!(
            std::fs::read(&out).unwrap(),
            std::fs::read(ca_dir.join("cert.pem")).unwrap()
        );

        let err = run_ca_command(CaCommand::Generate {
            ca_dir: Some(ca_dir),
            force: false,
        })
        .unwrap_err();
        assert!(err.to_string().contains("--force"), "unexpected error: {err}");
    }

    #[test]
    fn startup_summary_reports_listeners_and_storage() {
        let config = Config::from_toml_str(
            r#"
[tls]
ca_dir = "/srv/ca"

[storage]
path = "/srv/interactions.db"
"#,
        )
        .unwrap();

        let summary = startup_summary(
            &config,
            "127.0.0.1:8080".parse().unwrap(),
            Some("127.0.0.1:8000".parse().unwrap()),
        );
        assert_eq!(
            summary,
            "startup config: proxy_listen=127.0.0.1:8080, admin_listen=127.0.0.1:8000, storage=/srv/interactions.db, ca_dir=/srv/ca, config=defaults"
        );

        let summary = startup_summary(&Config::default(), "127.0.0.1:1".parse().unwrap(), None);
        assert!(summary.contains("admin_listen=disabled"), "{summary}");
        assert!(summary.contains("storage=in-memory"), "{summary}");
    }
}
