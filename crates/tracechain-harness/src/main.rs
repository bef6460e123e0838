//! Tracechain harness binary.
//!
//! # Usage
//!
//! ```bash
//! # Run the reference scenario against a live system and gate the trace chain
//! tracechain run --addr 127.0.0.1:4500 --token "$TOKEN" --verify
//!
//! # Run against the in-process simulation server
//! tracechain run --sim --verify
//!
//! # Re-check artifacts from an earlier run
//! tracechain verify --artifacts artifacts
//!
//! # Serve the simulation server over TCP
//! tracechain serve --bind 127.0.0.1:4500 --trace-export artifacts/observability/trace-export.json
//! ```
//!
//! Exit codes: 0 when every line passed, 2 when any line failed, 3 when the
//! harness could not run or could not write its evidence.

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use tracechain_client::{
    Connector, DEFAULT_CONNECT_TIMEOUT, DEFAULT_STEP_TIMEOUT, DriverConfig, StaticToken,
    TcpConnector,
};
use tracechain_harness::{
    ArtifactLayout, EXIT_FAIL, EXIT_INFRA, EXIT_PASS, EvidenceWriter, HarnessError,
    MemoryConnector, Orchestrator, ScenarioConfig, SimFaults, SimServer, SimServerConfig,
    StartPolicy, TraceChainGate, exit_code,
};
use tracechain_proto::AckType;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Multi-client session E2E harness and trace chain gate
#[derive(Parser, Debug)]
#[command(name = "tracechain")]
#[command(about = "Multi-client real-time session E2E harness and trace chain gate")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the multi-client scenario and write evidence
    Run(RunArgs),
    /// Check the trace chain and log tokens of existing artifacts
    Verify(VerifyArgs),
    /// Serve the simulation server over TCP
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// System under test, `host:port` or `tcp://host:port`
    #[arg(long, env = "TRACECHAIN_ADDR", default_value = "127.0.0.1:4500")]
    addr: String,

    /// Shared session id every client joins
    #[arg(long, env = "TRACECHAIN_SESSION_ID", default_value = "class-session-e2e")]
    session_id: String,

    /// Signed token presented by every client
    #[arg(long, env = "TRACECHAIN_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Artifact root directory
    #[arg(long, env = "TRACECHAIN_ARTIFACTS", default_value = "artifacts")]
    artifacts: PathBuf,

    /// Run against an in-process simulation server instead of `--addr`
    #[arg(long)]
    sim: bool,

    /// Start every client at once instead of one after another
    #[arg(long)]
    concurrent: bool,

    /// Number of clients before the disconnect
    #[arg(long, default_value = "2")]
    clients: usize,

    /// Deadline for each ack or aggregate wait
    #[arg(long, default_value_t = duration_ms(DEFAULT_STEP_TIMEOUT))]
    step_timeout_ms: u64,

    /// Deadline for opening each TCP connection
    #[arg(long, default_value_t = duration_ms(DEFAULT_CONNECT_TIMEOUT))]
    connect_timeout_ms: u64,

    /// Skip the disconnect and probe phase
    #[arg(long)]
    no_probe: bool,

    /// Run the trace chain gate after the scenario
    #[arg(long)]
    verify: bool,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Artifact root directory
    #[arg(long, env = "TRACECHAIN_ARTIFACTS", default_value = "artifacts")]
    artifacts: PathBuf,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to bind to
    #[arg(short, long, default_value = "127.0.0.1:4500")]
    bind: String,

    /// Require exactly this token on `auth`
    #[arg(long)]
    token: Option<String>,

    /// Rewrite the span export here after every event
    #[arg(long)]
    trace_export: Option<PathBuf>,

    /// Never send acks of this type (auth, join_session, event)
    #[arg(long, value_parser = parse_ack_type)]
    drop_ack: Vec<AckType>,

    /// Never push aggregates
    #[arg(long)]
    suppress_aggregates: bool,
}

const SIM_TOKEN: &str = "sim-token";

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_ack_type(value: &str) -> Result<AckType, String> {
    match value {
        "auth" => Ok(AckType::Auth),
        "join_session" | "join" => Ok(AckType::JoinSession),
        "event" => Ok(AckType::Event),
        other => Err(format!("unknown ack type `{other}`")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let outcome = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Verify(args) => verify(&args),
        Command::Serve(args) => serve(args).await.map(|()| EXIT_PASS),
    };

    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "harness error");
            ExitCode::from(EXIT_INFRA)
        },
    }
}

async fn run(args: RunArgs) -> Result<u8, HarnessError> {
    let layout = ArtifactLayout::new(&args.artifacts);
    let writer = EvidenceWriter::new(layout.clone());

    let policy = if args.concurrent { StartPolicy::Concurrent } else { StartPolicy::Sequenced };
    let driver = DriverConfig {
        step_timeout: Duration::from_millis(args.step_timeout_ms),
        ..DriverConfig::default()
    };
    let mut config = ScenarioConfig::with_clients(&args.session_id, args.clients)
        .with_policy(policy)
        .with_driver(driver);
    if args.no_probe {
        config = config.without_probe();
    }

    let connector: Arc<dyn Connector>;
    let token;
    if args.sim {
        let server = SimServer::new(SimServerConfig {
            trace_export: Some(layout.trace_export()),
            ..SimServerConfig::default()
        });
        connector = Arc::new(MemoryConnector::new(server));
        token = args.token.unwrap_or_else(|| SIM_TOKEN.to_string());
    } else {
        connector = Arc::new(
            TcpConnector::new(&args.addr)
                .with_connect_timeout(Duration::from_millis(args.connect_timeout_ms)),
        );
        token = args
            .token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| HarnessError::Config("--token is required without --sim".to_string()))?;
    }

    let orchestrator = Orchestrator::new(config, connector, Arc::new(StaticToken::new(token)));
    let outcome = orchestrator.run().await;
    writer.write_run(&outcome)?;
    let mut code = exit_code(&outcome.report);

    if args.verify {
        let report = TraceChainGate::default().run(&layout)?;
        writer.write_trace_chain_report(&report)?;
        code = code.max(exit_code(&report));
    }

    if code == EXIT_FAIL {
        tracing::warn!(root = %layout.root().display(), "run failed, see report");
    } else {
        tracing::info!(root = %layout.root().display(), "run passed");
    }
    Ok(code)
}

fn verify(args: &VerifyArgs) -> Result<u8, HarnessError> {
    let layout = ArtifactLayout::new(&args.artifacts);
    let report = TraceChainGate::default().run(&layout)?;
    EvidenceWriter::new(layout).write_trace_chain_report(&report)?;
    Ok(exit_code(&report))
}

async fn serve(args: ServeArgs) -> Result<(), HarnessError> {
    let server = SimServer::new(SimServerConfig {
        expected_token: args.token,
        faults: SimFaults {
            drop_acks: args.drop_ack,
            suppress_aggregates: args.suppress_aggregates,
            ..SimFaults::default()
        },
        trace_export: args.trace_export,
    });

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "simulation server listening");
    server.serve(listener).await?;
    Ok(())
}
