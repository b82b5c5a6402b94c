use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info};
use serde::Serialize;
use serde_json::{Value, json};

use hostpool::allocation::AllocationEngine;
use hostpool::config::{
    APP_NAME, AppConfig, default_config_dir, default_state_dir, env_prefix, expand_path,
    load_config, write_default_config,
};
use hostpool::identity::PRIVILEGE_TRUSTED;
use hostpool::spawner::{PollStatus, Spawner, StartRequest};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: Command) -> Result<()> {
    match cmd {
        Command::Probe { endpoint } => handle_probe(&ctx, &endpoint).await,
        Command::Acquire(cmd) => handle_acquire(&ctx, cmd).await,
        Command::Launch(cmd) => handle_launch(&ctx, cmd).await,
        Command::Poll(cmd) => handle_poll(&ctx, cmd).await,
        Command::Stop(cmd) => handle_stop(&ctx, cmd).await,
        other => Err(anyhow!("{other:?} is not an async command")),
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Hosts(cmd) => handle_hosts(&ctx, cmd),
        Command::Identity { account } => handle_identity(&ctx, &account),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
        cmd => async_main(ctx, cmd),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "hostpool - allocate GPU hosts and run notebook processes on them.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the machine types an account may use
    Hosts(HostsCommand),
    /// Check whether a machine endpoint accepts connections
    Probe {
        /// Machine endpoint (ip:port)
        endpoint: String,
    },
    /// Show the privilege level and remote account name of an account
    Identity {
        /// Account name (e.g. jane.doe@ubbcluj.ro)
        account: String,
    },
    /// Find a machine for a request without launching anything
    Acquire(AcquireCommand),
    /// Allocate a machine and start a notebook process for an account
    Launch(LaunchCommand),
    /// Check whether a launched process is still running
    Poll(SessionCommand),
    /// Kill a launched process and release its machine
    Stop(SessionCommand),
    /// Create config directories and default files
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
struct HostsCommand {
    /// Account to list machine types for; all types when omitted
    #[arg(long)]
    account: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct AcquireCommand {
    /// Machine type codename
    #[arg(long = "type", value_name = "CODENAME")]
    codename: String,
    /// Request shared access
    #[arg(long)]
    shared: bool,
}

#[derive(Debug, Clone, Args)]
struct LaunchCommand {
    /// Account the process is launched for
    #[arg(long)]
    account: String,
    /// Index into the machine types listed by `hosts --account`
    #[arg(long = "machine", default_value = "0")]
    machine_index: usize,
    /// Request shared access
    #[arg(long)]
    shared: bool,
    /// URL the process reports back to
    #[arg(long = "control-url", env = "HOSTPOOL_CONTROL_URL")]
    control_url: String,
    /// Extra environment for the process (KEY=VALUE, repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Args)]
struct SessionCommand {
    /// Account the process was launched for
    #[arg(long)]
    account: String,
    /// State blob (JSON) printed by `launch`; read from the state directory when omitted
    #[arg(long)]
    state: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
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

fn parse_key_val(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got {s:?}"))?;
    Ok((key.to_string(), value.to_string()))
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(self.config.logging.level.as_str()),
        );
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure state dir {}",
                self.paths.state_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })
    }

    fn engine(&self) -> Result<Arc<AllocationEngine>> {
        let registry = self.config.registry()?;
        Ok(Arc::new(AllocationEngine::new(
            Arc::new(registry),
            self.config.probe_timeout(),
        )))
    }

    fn spawner(&self, account: &str, engine: Arc<AllocationEngine>) -> Spawner {
        Spawner::new(
            account,
            account,
            &self.config.identity,
            engine,
            Arc::new(self.config.shell()),
            self.config.launcher.clone(),
        )
    }

    /// Print `value` as JSON/YAML when requested, otherwise the text rendering.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        let output = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else if self.common.yaml {
            serde_yaml::to_string(value).context("serializing output to YAML")?
        } else {
            text()
        };
        println!("{output}");
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    state_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            state_dir: default_state_dir()?,
        })
    }

    /// Where the state blob of `account` is kept between CLI invocations.
    fn session_file(&self, account: &str) -> PathBuf {
        let name: String = account
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .collect();
        self.state_dir.join(format!("{name}.json"))
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, state: {}",
            self.config_file.display(),
            self.state_dir.display()
        )
    }
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    load_config(&paths.config_file, &env_prefix())
}

fn handle_hosts(ctx: &RuntimeContext, cmd: HostsCommand) -> Result<()> {
    let privilege = match cmd.account.as_deref() {
        Some(account) => ctx.config.identity.privilege_of(account),
        None => PRIVILEGE_TRUSTED,
    };
    let hosts = ctx.engine()?.list_available(privilege);
    let listings: Vec<_> = hosts.iter().map(|h| h.listing()).collect();

    ctx.emit(&listings, || {
        if hosts.is_empty() {
            return "No machine types configured.".to_string();
        }
        hosts
            .iter()
            .enumerate()
            .map(|(index, h)| {
                format!(
                    "{index}  {:<12} {:<28} shared={} privileged={} gpus={}",
                    h.codename,
                    h.display_name.as_deref().unwrap_or("-"),
                    h.shared_access_enabled,
                    h.privileged_access_required,
                    if h.gpus.is_empty() {
                        "-".to_string()
                    } else {
                        h.gpus.join(", ")
                    }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

fn handle_identity(ctx: &RuntimeContext, account: &str) -> Result<()> {
    let policy = &ctx.config.identity;
    let privilege = policy.privilege_of(account);
    let technical_id = policy.technical_id_of(account);
    let value = json!({
        "account": account,
        "privilege": privilege,
        "technical_id": technical_id,
    });
    ctx.emit(&value, || {
        format!("{account}: privilege {privilege}, remote account {technical_id}")
    })
}

async fn handle_probe(ctx: &RuntimeContext, endpoint: &str) -> Result<()> {
    let engine = ctx.engine()?;
    let online = engine.probe_online(endpoint).await;
    let value = json!({ "endpoint": endpoint, "online": online });
    ctx.emit(&value, || {
        format!(
            "{endpoint} is {}",
            if online { "online" } else { "offline" }
        )
    })
}

async fn handle_acquire(ctx: &RuntimeContext, cmd: AcquireCommand) -> Result<()> {
    let engine = ctx.engine()?;
    let host_type = engine
        .registry()
        .get(&cmd.codename)
        .cloned()
        .ok_or_else(|| anyhow!("unknown machine type {}", cmd.codename))?;

    let hostname = engine
        .find(&host_type, cmd.shared)
        .await
        .ok_or_else(|| anyhow!("no available machine of type {}", cmd.codename))?;

    let value = json!({ "codename": cmd.codename, "shared": cmd.shared, "hostname": hostname });
    ctx.emit(&value, || hostname.clone())
}

async fn handle_launch(ctx: &RuntimeContext, cmd: LaunchCommand) -> Result<()> {
    if ctx.common.dry_run {
        info!(
            "dry-run: would launch for {} on machine type #{} (shared: {})",
            cmd.account, cmd.machine_index, cmd.shared
        );
        return Ok(());
    }

    let engine = ctx.engine()?;
    let mut spawner = ctx.spawner(&cmd.account, engine);
    spawner.options();

    let environment: HashMap<String, String> = cmd.env.into_iter().collect();
    let request = StartRequest {
        machine_index: cmd.machine_index,
        shared: cmd.shared,
    };
    let (ip, port) = spawner
        .start(request, &environment, &cmd.control_url)
        .await
        .with_context(|| format!("launching for {}", cmd.account))?;

    let state = spawner.state();
    let session_file = ctx.paths.session_file(&cmd.account);
    fs::write(&session_file, serde_json::to_vec_pretty(&state)?)
        .with_context(|| format!("writing session state to {}", session_file.display()))?;

    ctx.emit(&state, || {
        format!(
            "Launched session {} for {} (privilege {}) as {} at {ip}:{port}\n{}",
            spawner.owner_id(),
            spawner.account(),
            spawner.privilege(),
            spawner.principal(),
            serde_json::to_string(&state).unwrap_or_default()
        )
    })
}

fn read_session_state(ctx: &RuntimeContext, cmd: &SessionCommand) -> Result<Value> {
    match &cmd.state {
        Some(text) => serde_json::from_str(text).context("parsing --state as JSON"),
        None => {
            let path = ctx.paths.session_file(&cmd.account);
            if !path.exists() {
                return Ok(Value::Null);
            }
            let body = fs::read_to_string(&path)
                .with_context(|| format!("reading session state from {}", path.display()))?;
            serde_json::from_str(&body)
                .with_context(|| format!("parsing session state in {}", path.display()))
        }
    }
}

async fn handle_poll(ctx: &RuntimeContext, cmd: SessionCommand) -> Result<()> {
    let blob = read_session_state(ctx, &cmd)?;
    let engine = ctx.engine()?;
    let mut spawner = ctx.spawner(&cmd.account, engine);

    spawner.load_state(&blob).await;
    let status = spawner.poll().await;

    let value = json!({ "account": cmd.account, "status": status });
    ctx.emit(&value, || match status {
        PollStatus::Running => format!("{}: running", cmd.account),
        PollStatus::Exited => format!("{}: exited", cmd.account),
    })
}

async fn handle_stop(ctx: &RuntimeContext, cmd: SessionCommand) -> Result<()> {
    let blob = read_session_state(ctx, &cmd)?;
    if ctx.common.dry_run {
        info!("dry-run: would stop {} with state {}", cmd.account, blob);
        return Ok(());
    }

    let engine = ctx.engine()?;
    let mut spawner = ctx.spawner(&cmd.account, engine);
    spawner.load_state(&blob).await;
    spawner.stop().await;

    remove_session_file(&ctx.paths.session_file(&cmd.account))?;
    ctx.emit(&json!({ "account": cmd.account, "stopped": true }), || {
        format!("{}: stopped", cmd.account)
    })
}

fn remove_session_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_launch() {
        let cli = Cli::try_parse_from([
            "hostpool",
            "launch",
            "--account",
            "jane@ubbcluj.ro",
            "--machine",
            "1",
            "--shared",
            "--control-url",
            "http://hub:8081/hub/api",
            "--env",
            "JUPYTERHUB_USER=jane",
        ])
        .unwrap();

        let Command::Launch(cmd) = cli.command else {
            panic!("expected launch");
        };
        assert_eq!(cmd.machine_index, 1);
        assert!(cmd.shared);
        assert_eq!(
            cmd.env,
            vec![("JUPYTERHUB_USER".to_string(), "jane".to_string())]
        );
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn test_session_file_name_is_sanitized() {
        let paths = AppPaths {
            config_file: PathBuf::from("/tmp/config.toml"),
            state_dir: PathBuf::from("/tmp/state"),
        };
        assert_eq!(
            paths.session_file("jane.doe@ubbcluj.ro"),
            PathBuf::from("/tmp/state/jane.doe_ubbcluj.ro.json")
        );
    }

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }
}
