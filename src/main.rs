use anyhow::{bail, Context};
use ephemeral_server::config::{FixtureConfig, CONFIG_ENV};
use ephemeral_server::httpd::{httpd_server, HttpdOptions};
use ephemeral_server::logging;
use std::path::PathBuf;
use tracing::{error, info};

const USAGE: &str = "usage: ephemeral-httpd [CONFIG.toml] [--proxy SRC=DEST]... [--document-root DIR] [--log-dir DIR] [--hostname HOST] [--extra-cfg FILE]";

struct Args {
    config_path: Option<PathBuf>,
    options: HttpdOptions,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = None;
    let mut options = HttpdOptions::new();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().with_context(|| format!("{} requires a value\n{}", flag, USAGE));
        match arg.as_str() {
            "--proxy" => {
                let rule = value("--proxy")?;
                let (source, destination) = rule
                    .split_once('=')
                    .with_context(|| format!("--proxy expects SRC=DEST, got '{}'", rule))?;
                options = options.proxy_rule(source, destination);
            }
            "--document-root" => options = options.document_root(value("--document-root")?),
            "--log-dir" => options = options.log_dir(value("--log-dir")?),
            "--hostname" => options = options.hostname(value("--hostname")?),
            "--extra-cfg" => {
                let path = value("--extra-cfg")?;
                let cfg = std::fs::read_to_string(&path).with_context(|| format!("cannot read {}", path))?;
                options = options.extra_cfg(cfg);
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            flag if flag.starts_with('-') => bail!("unknown option '{}'\n{}", flag, USAGE),
            path if config_path.is_none() => config_path = Some(PathBuf::from(path)),
            extra => bail!("unexpected argument '{}'\n{}", extra, USAGE),
        }
    }

    Ok(Args { config_path, options })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let args = parse_args()?;

    // An explicit file wins over SERVER_FIXTURES_CONFIG; env overrides apply to both
    let config = match args.config_path {
        Some(ref path) => FixtureConfig::from_lookup(|key| {
            if key == CONFIG_ENV {
                Some(path.to_string_lossy().to_string())
            } else {
                std::env::var(key).ok()
            }
        }),
        None => FixtureConfig::from_env(),
    }
    .map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    let mut server = match httpd_server(&config, args.options).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, category = ?e.category(), "httpd failed to start");
            return Err(e.into());
        }
    };

    info!(
        uri = %server.uri(),
        workspace = %server.workspace().display(),
        pid = server.pid(),
        "httpd is ready"
    );
    println!("{}", server.uri());

    // Hold until Ctrl+C or SIGTERM, or until httpd dies on its own
    let mut watchdog = tokio::time::interval(std::time::Duration::from_secs(1));
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = watchdog.tick() => {
                    if let Err(e) = server.check_alive() {
                        error!(error = %e, "httpd exited");
                        break;
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    break;
                }
                _ = watchdog.tick() => {
                    if let Err(e) = server.check_alive() {
                        error!(error = %e, "httpd exited");
                        break;
                    }
                }
            }
        }
    }

    server.teardown().await;
    info!("Shutdown complete");
    Ok(())
}
