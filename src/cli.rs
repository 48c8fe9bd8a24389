use crate::config::LightsConfig;
use crate::launcher::LaunchRequest;
use crate::platform::parse_signal;
use crate::report::{GroupFilter, ALL_GROUPS};
use crate::terminator::TerminatePolicy;
use clap::builder::NonEmptyStringValueParser;
use clap::{ArgGroup, Args, Parser, Subcommand};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::time::Duration;

/// Start, stop, and inspect named groups of OS processes.
#[derive(Parser, Debug)]
#[command(name = "lights", version, about)]
pub struct Cli {
    /// Config file path [default: lights.toml]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Metadata file path (overrides config)
    #[arg(long, global = true)]
    pub meta: Option<PathBuf>,

    /// Extra logging (liveness checks, spawn details)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only errors and results
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start N instances of a process under a name
    #[command(visible_aliases = ["launch", "start"])]
    On(OnArgs),

    /// Signal every process of a group and forget it
    #[command(visible_aliases = ["terminate", "stop"])]
    Off(OffArgs),

    /// Show CPU, memory, and uptime for registered processes
    #[command(visible_alias = "ls")]
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct OnArgs {
    /// Command (or script, when --binary is set) to run
    #[arg(short, long, value_parser = NonEmptyStringValueParser::new())]
    pub process: String,

    /// Group name [default: the process string]
    #[arg(short, long, value_parser = NonEmptyStringValueParser::new())]
    pub name: Option<String>,

    /// Number of instances to start
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub cameras: u32,

    /// Interpreter to run the process with (overrides config)
    #[arg(short, long, value_parser = NonEmptyStringValueParser::new())]
    pub binary: Option<String>,

    /// Directory for per-instance stdout/stderr logs (overrides config)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Arguments passed to every instance
    #[arg(last = true)]
    pub args: Vec<String>,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("target").required(true).multiple(true).args(["name", "process"])))]
pub struct OffArgs {
    /// Group name
    #[arg(short, long, value_parser = NonEmptyStringValueParser::new())]
    pub name: Option<String>,

    /// Process string the group was started with (used when --name is absent)
    #[arg(short, long, value_parser = NonEmptyStringValueParser::new())]
    pub process: Option<String>,

    /// Signal to send, e.g. SIGTERM or 15 (overrides config)
    #[arg(short, long, value_parser = signal_value)]
    pub signal: Option<Signal>,

    /// Milliseconds to wait for the processes to exit (overrides config)
    #[arg(long)]
    pub grace_ms: Option<u64>,

    /// Send SIGKILL to processes still running after the grace period
    #[arg(long)]
    pub kill: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Group name, or * for all groups
    #[arg(default_value = ALL_GROUPS)]
    pub filter: String,

    /// Print rows as JSON
    #[arg(long)]
    pub json: bool,
}

fn signal_value(value: &str) -> Result<Signal, String> {
    parse_signal(value).ok_or_else(|| format!("unknown signal: {value}"))
}

/// A fully resolved action, ready for the core.
#[derive(Debug, PartialEq)]
pub enum CommandRequest {
    Launch(LaunchRequest),
    Terminate {
        name: String,
        policy: TerminatePolicy,
    },
    List {
        filter: GroupFilter,
        json: bool,
    },
}

/// Arguments that parsed but do not make sense together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ValidationError {}

impl Command {
    /// Merge CLI arguments with config defaults.
    ///
    /// `cpus` is the number of CPUs available to this process.
    pub fn resolve(
        self,
        config: &LightsConfig,
        cpus: u32,
    ) -> Result<CommandRequest, ValidationError> {
        match self {
            Command::On(args) => resolve_launch(args, config, cpus).map(CommandRequest::Launch),
            Command::Off(args) => resolve_terminate(args, config),
            Command::List(args) => Ok(CommandRequest::List {
                filter: GroupFilter::parse(Some(&args.filter)),
                json: args.json,
            }),
        }
    }
}

fn resolve_launch(
    args: OnArgs,
    config: &LightsConfig,
    cpus: u32,
) -> Result<LaunchRequest, ValidationError> {
    if args.cameras == 0 {
        return Err(ValidationError("--cameras must be at least 1".to_string()));
    }
    let name = args.name.unwrap_or_else(|| args.process.clone());

    let mut instances = args.cameras;
    if config.launch.cap_to_cpus && instances > cpus.max(1) {
        tracing::warn!(
            requested = instances,
            cpus,
            "instance count exceeds available CPUs, capping"
        );
        instances = cpus.max(1);
    }

    Ok(LaunchRequest {
        name,
        process: args.process,
        args: args.args,
        instances,
        binary: args.binary.or_else(|| config.launch.default_binary.clone()),
        log_dir: args.log_dir.or_else(|| config.launch.log_dir.clone()),
    })
}

fn resolve_terminate(args: OffArgs, config: &LightsConfig) -> Result<CommandRequest, ValidationError> {
    let name = args
        .name
        .or(args.process)
        .ok_or_else(|| ValidationError("one of --name or --process is required".to_string()))?;

    let mut policy = config
        .terminate_policy()
        .map_err(|e| ValidationError(e.to_string()))?;
    if let Some(signal) = args.signal {
        policy.signal = signal;
    }
    if let Some(ms) = args.grace_ms {
        policy.grace_period = Duration::from_millis(ms);
    }
    if args.kill {
        policy.escalate_to_kill = true;
    }
    Ok(CommandRequest::Terminate { name, policy })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("lights").chain(args.iter().copied()))
    }

    fn resolve(args: &[&str]) -> CommandRequest {
        parse(args)
            .unwrap()
            .command
            .resolve(&LightsConfig::default(), 8)
            .unwrap()
    }

    fn launch(args: &[&str]) -> LaunchRequest {
        match resolve(args) {
            CommandRequest::Launch(r) => r,
            other => panic!("expected launch, got {other:?}"),
        }
    }

    #[test]
    fn test_on_defaults_name_to_process() {
        let req = launch(&["on", "--process", "./cam.sh"]);
        assert_eq!(req.name, "./cam.sh");
        assert_eq!(req.process, "./cam.sh");
        assert_eq!(req.instances, 1);
        assert_eq!(req.binary, None);
        assert!(req.args.is_empty());
    }

    #[test]
    fn test_on_aliases_and_trailing_args() {
        let req = launch(&[
            "start", "-p", "index.ts", "-n", "cam1", "--cameras", "3", "-b", "bun", "--", "--port",
            "9000",
        ]);
        assert_eq!(req.name, "cam1");
        assert_eq!(req.instances, 3);
        assert_eq!(req.binary.as_deref(), Some("bun"));
        assert_eq!(req.args, vec!["--port", "9000"]);
        assert_eq!(launch(&["launch", "-p", "x"]).name, "x");
    }

    #[test]
    fn test_on_caps_instances_to_cpus() {
        let req = launch(&["on", "-p", "x", "--cameras", "64"]);
        assert_eq!(req.instances, 8);
    }

    #[test]
    fn test_on_cap_can_be_disabled() {
        let mut config = LightsConfig::default();
        config.launch.cap_to_cpus = false;
        let cli = parse(&["on", "-p", "x", "--cameras", "64"]).unwrap();
        match cli.command.resolve(&config, 8).unwrap() {
            CommandRequest::Launch(req) => assert_eq!(req.instances, 64),
            other => panic!("expected launch, got {other:?}"),
        }
    }

    #[test]
    fn test_on_uses_config_defaults_unless_overridden() {
        let mut config = LightsConfig::default();
        config.launch.default_binary = Some("node".to_string());
        config.launch.log_dir = Some(PathBuf::from("logs"));

        let cli = parse(&["on", "-p", "app.js"]).unwrap();
        let CommandRequest::Launch(req) = cli.command.resolve(&config, 4).unwrap() else {
            panic!("expected launch");
        };
        assert_eq!(req.binary.as_deref(), Some("node"));
        assert_eq!(req.log_dir, Some(PathBuf::from("logs")));

        let cli = parse(&["on", "-p", "app.js", "-b", "bun", "--log-dir", "/tmp/l"]).unwrap();
        let CommandRequest::Launch(req) = cli.command.resolve(&config, 4).unwrap() else {
            panic!("expected launch");
        };
        assert_eq!(req.binary.as_deref(), Some("bun"));
        assert_eq!(req.log_dir, Some(PathBuf::from("/tmp/l")));
    }

    #[test]
    fn test_on_rejects_bad_arguments() {
        assert_eq!(
            parse(&["on"]).unwrap_err().kind(),
            ErrorKind::MissingRequiredArgument
        );
        assert_eq!(
            parse(&["on", "-p", "x", "--cameras", "0"]).unwrap_err().kind(),
            ErrorKind::ValueValidation
        );
        assert_eq!(
            parse(&["on", "-p", "x", "--cameras", "two"]).unwrap_err().kind(),
            ErrorKind::ValueValidation
        );
        assert!(parse(&["on", "-p", ""]).is_err());
    }

    #[test]
    fn test_off_requires_name_or_process() {
        assert_eq!(
            parse(&["off"]).unwrap_err().kind(),
            ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn test_off_prefers_name_over_process() {
        match resolve(&["stop", "--process", "./cam.sh", "--name", "cam1"]) {
            CommandRequest::Terminate { name, policy } => {
                assert_eq!(name, "cam1");
                assert_eq!(policy, TerminatePolicy::default());
            }
            other => panic!("expected terminate, got {other:?}"),
        }
        match resolve(&["terminate", "-p", "./cam.sh"]) {
            CommandRequest::Terminate { name, .. } => assert_eq!(name, "./cam.sh"),
            other => panic!("expected terminate, got {other:?}"),
        }
    }

    #[test]
    fn test_off_policy_overrides() {
        match resolve(&["off", "-n", "cam1", "-s", "TERM", "--grace-ms", "250", "--kill"]) {
            CommandRequest::Terminate { policy, .. } => {
                assert_eq!(policy.signal, Signal::SIGTERM);
                assert_eq!(policy.grace_period, Duration::from_millis(250));
                assert!(policy.escalate_to_kill);
            }
            other => panic!("expected terminate, got {other:?}"),
        }
        assert_eq!(
            parse(&["off", "-n", "cam1", "-s", "SIGNOPE"])
                .unwrap_err()
                .kind(),
            ErrorKind::ValueValidation
        );
    }

    #[test]
    fn test_list_filter() {
        assert_eq!(
            resolve(&["list"]),
            CommandRequest::List {
                filter: GroupFilter::All,
                json: false,
            }
        );
        assert_eq!(
            resolve(&["ls", "cam1", "--json"]),
            CommandRequest::List {
                filter: GroupFilter::Named("cam1".to_string()),
                json: true,
            }
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = parse(&["list", "--meta", "/tmp/x.meta", "-v"]).unwrap();
        assert_eq!(cli.meta, Some(PathBuf::from("/tmp/x.meta")));
        assert!(cli.verbose);
        assert!(parse(&["list", "-v", "-q"]).is_err());
    }
}
