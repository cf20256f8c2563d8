use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::ratelimit::{unix_now, Fingerprint, Identity};

/// Exit code for a denied `check`.
const EXIT_DENIED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "floodgate", version, about = "Durable sliding-window rate limiter")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check an attempt and record it if allowed
    Check {
        #[command(flatten)]
        caller: CallerArgs,

        /// Evaluate at this Unix time instead of now
        #[arg(long)]
        now: Option<i64>,
    },
    /// Print the fingerprint for a caller and action
    Fingerprint {
        #[command(flatten)]
        caller: CallerArgs,
    },
    /// Show the attempts counted against a caller
    Inspect {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Forget a caller's history
    Reset {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Run retention maintenance on the store
    Sweep,
}

#[derive(Args, Debug)]
struct CallerArgs {
    /// Action being rate limited, e.g. submit-contact-form
    #[arg(short, long)]
    action: String,

    /// Client network address
    #[arg(long, default_value = "")]
    address: String,

    /// Client user agent
    #[arg(long, default_value = "")]
    user_agent: String,

    /// Supplemental caller token; never part of the fingerprint
    #[arg(long)]
    token: Option<String>,
}

impl CallerArgs {
    fn identity(&self) -> Identity {
        let identity = Identity::new(self.address.as_str(), self.user_agent.as_str());
        match &self.token {
            Some(token) => identity.token(token.as_str()),
            None => identity,
        }
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.action, &self.identity())
    }
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Action whose policy applies; optional with --fingerprint
    #[arg(short, long, required_unless_present = "fingerprint")]
    action: Option<String>,

    /// Hex fingerprint; derived from --address/--user-agent when omitted
    #[arg(long)]
    fingerprint: Option<String>,

    /// Client network address
    #[arg(long, default_value = "")]
    address: String,

    /// Client user agent
    #[arg(long, default_value = "")]
    user_agent: String,
}

impl TargetArgs {
    fn fingerprint(&self) -> anyhow::Result<Fingerprint> {
        match &self.fingerprint {
            Some(hex) => Ok(Fingerprint::parse(hex)?),
            None => Ok(Fingerprint::new(
                self.action.as_deref().unwrap_or_default(),
                &Identity::new(self.address.as_str(), self.user_agent.as_str()),
            )),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    debug!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = FloodgateConfig::load(cli.config.as_deref())?;
    debug!(store = ?config.store, "Configuration loaded");

    let limiter = config.build_limiter()?;

    match cli.command {
        Command::Fingerprint { caller } => {
            println!("{}", caller.fingerprint());
            Ok(ExitCode::SUCCESS)
        }
        Command::Check { caller, now } => {
            let now = now.unwrap_or_else(unix_now);
            let decision = limiter
                .check(&caller.action, &caller.identity(), now)
                .await;

            info!(action = %caller.action, decision = %decision, "Rate limit decision made");
            println!(
                "{}",
                serde_json::json!({
                    "fingerprint": caller.fingerprint(),
                    "outcome": decision,
                    "message": decision.message(),
                })
            );

            if decision.is_allowed() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_DENIED))
            }
        }
        Command::Inspect { target } => {
            let fingerprint = target.fingerprint()?;
            let rules = limiter.rules();
            let policy = *target
                .action
                .as_deref()
                .map_or(&rules.default, |action| rules.policy_for(action));
            let window = limiter.window(&fingerprint, unix_now(), &policy).await;

            println!(
                "{}",
                serde_json::json!({
                    "fingerprint": fingerprint,
                    "policy": policy,
                    "attempts": window.as_slice(),
                })
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset { target } => {
            let fingerprint = target.fingerprint()?;
            let removed = limiter.reset(&fingerprint).await?;

            info!(fingerprint = %fingerprint, removed, "Reset complete");
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep => {
            let report = limiter.sweep(unix_now()).await;

            info!(
                scanned = report.scanned,
                removed = report.removed(),
                failures = report.failures,
                "Sweep complete"
            );
            println!("{}", serde_json::to_string(&report)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Install the tracing subscriber, honouring `RUST_LOG` (default `info`).
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
