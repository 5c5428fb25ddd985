use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, error, info, warn};

use agp_bridge::agent::{DefaultRouter, SubprocessRuntime};
use agp_bridge::config::{self as bridge_config, AppConfig, LoggingConfig};
use agp_bridge::connection::{ConnectionManager, WsTransport};
use agp_bridge::engine::SessionEngine;

const APP_NAME: &str = "agp-bridge";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_run(ctx: RuntimeContext, cmd: RunCommand) -> Result<()> {
    handle_run(ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.global)?;
    init_logging(&ctx.opts, &ctx.config.logging)?;
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Run(cmd) => async_run(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "AGP bridge - connects a local agent to a remote AGP session peer.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct GlobalOpts {
    /// Config file [default: $XDG_CONFIG_HOME/agp-bridge/config.toml]
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// JSON log lines; `config show` prints JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// `config show` prints YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Resolve and validate everything, but never connect or write files
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    #[command(flatten)]
    log: LogOpts,
}

#[derive(Debug, Clone, Args)]
struct LogOpts {
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// -v logs turns and frames at debug, -vv at trace
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Same as -v
    #[arg(long, global = true)]
    debug: bool,
    /// Same as -vv
    #[arg(long, global = true)]
    trace: bool,
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Add module path and source location to stderr log lines
    #[arg(long = "log-source", global = true)]
    log_source: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

impl LogOpts {
    /// Command-line verbosity wins over `logging.level` from the config.
    fn level(&self, configured: &str) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else if self.trace || self.verbose >= 2 {
            LevelFilter::Trace
        } else if self.debug || self.verbose == 1 {
            LevelFilter::Debug
        } else {
            configured.parse().unwrap_or(LevelFilter::Info)
        }
    }

    fn ansi(&self) -> bool {
        if self.no_color || env::var_os("NO_COLOR").is_some() {
            return false;
        }
        match self.color {
            ColorOption::Always => true,
            ColorOption::Never => false,
            ColorOption::Auto => env::var_os("FORCE_COLOR").is_some() || io::stderr().is_terminal(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to the peer and serve prompts until stopped
    Run(RunCommand),
    /// Create the config directory and default config file
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct RunCommand {
    /// Peer WebSocket URL (ws:// or wss://)
    #[arg(long, value_name = "URL")]
    url: Option<String>,
    /// Device identifier sent as `guid`
    #[arg(long, value_name = "ID")]
    device_id: Option<String>,
    /// Account identifier sent as `user_id`
    #[arg(long, value_name = "ID")]
    account_id: Option<String>,
    /// Credential token passed to the peer
    #[arg(long, env = "AGP_BRIDGE_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Override the profile to run under
    #[arg(long, value_name = "PROFILE")]
    profile: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Overwrite an existing config file
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    opts: GlobalOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(opts: GlobalOpts) -> Result<Self> {
        let config_file = resolve_config_file(opts.config.as_deref())?;
        let config = load_or_init_config(&config_file, opts.dry_run)?;
        Ok(Self {
            opts,
            config_file,
            config,
        })
    }
}

/// Stderr logging plus an optional append-only log file from `logging.file`.
fn init_logging(opts: &GlobalOpts, logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let level = opts.log.level(&logging.level);
    let directive = level.as_str().to_ascii_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("agp_bridge={directive},agp_protocol={directive}"))
    });

    // The file layer sits directly on the registry; the stderr layer varies.
    let file_layer = logging
        .file
        .as_deref()
        .map(open_log_file)
        .transpose()?
        .map(|file| fmt::layer().with_ansi(false).with_writer(Mutex::new(file)));
    let base = tracing_subscriber::registry().with(file_layer).with(filter);

    let stderr = fmt::layer()
        .with_writer(io::stderr)
        .with_target(opts.log.log_source)
        .with_file(opts.log.log_source)
        .with_line_number(opts.log.log_source);
    if opts.json {
        base.with(stderr.json()).try_init().ok();
    } else {
        base.with(stderr.with_ansi(opts.log.ansi())).try_init().ok();
    }

    // Fallback for `log` records when no LogTracer got installed.
    env_logger::Builder::new()
        .filter_level(level)
        .try_init()
        .ok();

    Ok(())
}

fn open_log_file(path: &str) -> Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {path}"))
}

async fn handle_run(ctx: RuntimeContext, cmd: RunCommand) -> Result<()> {
    let mut config = ctx.config;
    if let Some(profile) = cmd.profile {
        config.profile = profile;
    }
    if let Some(url) = cmd.url {
        config.connection.url = url;
    }
    if let Some(device_id) = cmd.device_id {
        config.connection.device_id = device_id;
    }
    if let Some(account_id) = cmd.account_id {
        config.connection.account_id = Some(account_id);
    }
    if let Some(token) = cmd.token {
        config.connection.token = Some(token);
    }

    config
        .validate()
        .with_context(|| format!("checking {}", ctx.config_file.display()))?;

    let connection_config = config.connection_config();
    if ctx.opts.dry_run {
        info!(
            "dry-run: would connect to {} as device '{}' (profile '{}')",
            connection_config.target.redacted_url(),
            config.connection.device_id,
            config.profile
        );
        return Ok(());
    }

    let transport = Arc::new(WsTransport::with_buffer(config.connection.send_buffer));
    let connection = Arc::new(ConnectionManager::new(connection_config, transport));
    let runtime = Arc::new(SubprocessRuntime::new(
        config
            .subprocess_config()
            .context("resolving agent settings")?,
    ));
    let router = Arc::new(DefaultRouter::new(config.agent.agent_app.clone()));

    let engine = SessionEngine::new(connection, runtime, router).await;
    info!(
        "Starting {} (profile '{}') with agent '{}'",
        APP_NAME, config.profile, config.agent.command
    );
    engine.start().await;

    let stopped = engine.wait();
    tokio::pin!(stopped);

    tokio::select! {
        result = &mut stopped => {
            result.context("connection to AGP peer failed")?;
            info!("Connection supervisor exited");
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, closing connection...");
            engine.shutdown().await;
            if let Err(e) = stopped.await {
                warn!("Error during shutdown: {:?}", e);
            }
            info!("Shutdown complete");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.config_file.display()
        ));
    }
    write_default_config(&ctx.config_file, ctx.opts.dry_run)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let rendered = if ctx.opts.json {
                serde_json::to_string_pretty(&ctx.config).context("serializing config to JSON")?
            } else if ctx.opts.yaml {
                serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
            } else {
                toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
            };
            println!("{rendered}");
        }
        ConfigCommand::Path => println!("{}", ctx.config_file.display()),
        ConfigCommand::Reset => write_default_config(&ctx.config_file, ctx.opts.dry_run)?,
    }
    Ok(())
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

/// `--config` (a directory means `<dir>/config.toml`), else the XDG location.
fn resolve_config_file(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        let expanded = match path.to_str() {
            Some(text) => bridge_config::expand_path(text)?,
            None => path.to_path_buf(),
        };
        return Ok(if expanded.is_dir() {
            expanded.join("config.toml")
        } else {
            expanded
        });
    }

    let base = env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .context("unable to determine configuration directory")?;
    Ok(base.join(APP_NAME).join("config.toml"))
}

fn load_or_init_config(path: &Path, dry_run: bool) -> Result<AppConfig> {
    if !path.exists() {
        write_default_config(path, dry_run)?;
    }

    let mut config = AppConfig::load(path, bridge_config::ENV_PREFIX)
        .with_context(|| format!("loading config from {}", path.display()))?;

    if let Some(ref file) = config.logging.file {
        let expanded = bridge_config::expand_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

fn write_default_config(path: &Path, dry_run: bool) -> Result<()> {
    if dry_run {
        info!("dry-run: would write default config to {}", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }

    let body = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config to TOML")?;
    let header = format!(
        "# {APP_NAME} configuration\n# Override any key with {}__SECTION__KEY, e.g. {}__CONNECTION__URL\n\n",
        bridge_config::ENV_PREFIX,
        bridge_config::ENV_PREFIX,
    );
    fs::write(path, header + &body).with_context(|| format!("writing config file to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once(APP_NAME).chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verbosity_overrides_configured_level() {
        assert_eq!(parse(&["run"]).global.log.level("warn"), LevelFilter::Warn);
        assert_eq!(parse(&["run"]).global.log.level("bogus"), LevelFilter::Info);
        assert_eq!(parse(&["-v", "run"]).global.log.level("warn"), LevelFilter::Debug);
        assert_eq!(parse(&["run", "-vv"]).global.log.level("warn"), LevelFilter::Trace);
        assert_eq!(parse(&["--trace", "run"]).global.log.level("warn"), LevelFilter::Trace);
        assert_eq!(parse(&["-q", "-v", "run"]).global.log.level("debug"), LevelFilter::Error);
    }

    #[test]
    fn test_run_overrides_parse() {
        let cli = parse(&["run", "--url", "wss://peer/ws", "--device-id", "dev-1", "--account-id", "acct"]);
        let Command::Run(cmd) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(cmd.url.as_deref(), Some("wss://peer/ws"));
        assert_eq!(cmd.device_id.as_deref(), Some("dev-1"));
        assert_eq!(cmd.account_id.as_deref(), Some("acct"));
    }

    #[test]
    fn test_json_and_yaml_conflict() {
        assert!(Cli::try_parse_from([APP_NAME, "--json", "--yaml", "config", "show"]).is_err());
    }

    #[test]
    fn test_never_color_disables_ansi() {
        assert!(!parse(&["--color", "never", "run"]).global.log.ansi());
        assert!(!parse(&["--no-color", "run"]).global.log.ansi());
    }

    #[test]
    fn test_config_dir_argument_resolves_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_config_file(Some(dir.path())).unwrap();
        assert_eq!(resolved, dir.path().join("config.toml"));

        let file = dir.path().join("custom.toml");
        assert_eq!(resolve_config_file(Some(&file)).unwrap(), file);
    }

    #[test]
    fn test_default_config_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        write_default_config(&path, true).unwrap();
        assert!(!path.exists());

        let config = load_or_init_config(&path, false).unwrap();
        assert!(path.exists());
        assert_eq!(config, AppConfig::default());
        assert!(fs::read_to_string(&path).unwrap().starts_with("# agp-bridge configuration"));
    }
}
