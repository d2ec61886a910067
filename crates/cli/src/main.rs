use clap::{Parser, Subcommand};
use devproxy_core::client::{self, RelayClient, RelayError};
use devproxy_core::gateway::RunRequest;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "devproxy")]
#[command(about = "DevProxy: token-gated remote command gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the config file with a fresh admin token and default allowlists, plus the log directory.
    Init {
        /// Config file path (default: DEVPROXY_CONFIG_PATH or ~/.devproxy/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Overwrite an existing config (generates a new token).
        #[arg(long)]
        force: bool,
    },

    /// Run the gateway. Creates a default config on first run.
    Serve {
        /// Config file path (default: DEVPROXY_CONFIG_PATH or ~/.devproxy/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP port (default from config or 2223)
        #[arg(long, short)]
        port: Option<u16>,

        /// Also shut down cleanly when stdin reaches end-of-file (for supervisors that own the pipe).
        #[arg(long)]
        stop_on_stdin_eof: bool,
    },

    /// Run a command on the gateway and print its output. Exits with the remote exit code.
    Exec {
        /// Config file path, used for the token and address (default: DEVPROXY_CONFIG_PATH or ~/.devproxy/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Admin token (default: DEVPROXY_TOKEN, then the config's api_token)
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,

        /// Remote working directory (default: the current directory)
        #[arg(long, value_name = "DIR")]
        cwd: Option<String>,

        /// Gateway base URL (default: http://<bind>:<port> from the config)
        #[arg(long, value_name = "URL")]
        url: Option<String>,

        /// Print the request and exit code to stderr.
        #[arg(long, short)]
        verbose: bool,

        /// Command and arguments.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Replace the admin token in the config file and print the new one.
    RotateToken {
        /// Config file path (default: DEVPROXY_CONFIG_PATH or ~/.devproxy/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("devproxy {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config, force }) => {
            if let Err(e) = run_init(config, force) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve {
            config,
            port,
            stop_on_stdin_eof,
        }) => {
            if let Err(e) = run_serve(config, port, stop_on_stdin_eof).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Exec {
            config,
            token,
            cwd,
            url,
            verbose,
            command,
        }) => match run_exec(config, token, cwd, url, verbose, command).await {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                log::error!("exec failed: {:#}", e);
                std::process::exit(1);
            }
        },
        Some(Commands::RotateToken { config }) => {
            if let Err(e) = run_rotate_token(config) {
                log::error!("rotate-token failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    use devproxy_core::init::InitOutcome;

    let path = config_path.unwrap_or_else(devproxy_core::config::default_config_path);
    match devproxy_core::init::init_config(&path, force)? {
        InitOutcome::Created => {
            println!("initialized configuration at {}", path.display());
            println!("admin token is stored in that file (api_token); keep it private");
        }
        InitOutcome::AlreadyExists => {
            println!(
                "configuration already exists at {} (use --force to overwrite)",
                path.display()
            );
        }
    }
    Ok(())
}

async fn run_serve(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    stop_on_stdin_eof: bool,
) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(devproxy_core::config::default_config_path);
    let (mut config, created) = devproxy_core::init::load_or_init(&path)?;
    if created {
        println!(
            "created {} with a new admin token; clients must send it in X-Admin-Token",
            path.display()
        );
    }
    if let Some(p) = port {
        config.port = p;
    }
    log::info!("starting gateway on {}:{}", config.bind, config.port);
    if stop_on_stdin_eof {
        devproxy_core::gateway::run_gateway_until(config, path, stdin_closed()).await
    } else {
        devproxy_core::gateway::run_gateway(config, path).await
    }
}

/// Completes once stdin is closed. Input is discarded.
async fn stdin_closed() {
    use tokio::io::AsyncReadExt;

    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 256];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("reading stdin: {}", e);
                break;
            }
        }
    }
}

/// Returns the remote exit code.
async fn run_exec(
    config_path: Option<PathBuf>,
    token: Option<String>,
    cwd: Option<String>,
    url: Option<String>,
    verbose: bool,
    command: Vec<String>,
) -> anyhow::Result<i32> {
    let (config, _) = devproxy_core::config::load_config(config_path)?;
    let token = token
        .filter(|t| !t.trim().is_empty())
        .or_else(|| devproxy_core::config::resolve_api_token(&config))
        .ok_or_else(|| anyhow::anyhow!("no admin token: pass --token, set DEVPROXY_TOKEN or run `devproxy init`"))?;
    let base_url = url.unwrap_or_else(|| client::base_url_for(&config));
    let cwd = match cwd {
        Some(c) => c,
        None => std::env::current_dir()?.to_string_lossy().into_owned(),
    };

    let mut parts = command.into_iter();
    let req = RunRequest {
        command: parts.next().unwrap_or_default(),
        args: parts.collect(),
        cwd,
    };
    if verbose {
        eprintln!("> {} {:?} in {} via {}", req.command, req.args, req.cwd, base_url);
    }

    let relay = RelayClient::new(base_url, token);
    let res = match relay.run(&req).await {
        Ok(res) => res,
        Err(RelayError::Unauthorized) => anyhow::bail!("gateway rejected the admin token"),
        Err(e) => return Err(e.into()),
    };

    std::io::stdout().write_all(res.stdout.as_bytes())?;
    std::io::stdout().flush()?;
    std::io::stderr().write_all(res.stderr.as_bytes())?;
    if verbose {
        eprintln!("< exit code {}", res.exit_code);
    }
    Ok(res.exit_code)
}

fn run_rotate_token(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(devproxy_core::config::default_config_path);
    let token = devproxy_core::init::rotate_token(&path)?;
    println!("{}", token);
    log::info!("restart the gateway for the new token to take effect");
    Ok(())
}
