//! simctl - CLI client for simd
//!
//! Local control plane client for the simulation supervisor daemon.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{ActionsQuery, Client, ClientError};

/// CLI client for the simd supervisor daemon.
#[derive(Parser)]
#[command(name = "simctl")]
#[command(about = "Control plane for the simd simulation supervisor")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7700)
    #[arg(long, global = true, env = "SIMD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "SIMD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch the worker for a staged run
    Start {
        run_id: String,

        /// Channel to drive, or "parallel" for all configured channels
        #[arg(long, default_value = "parallel")]
        platform: String,
    },

    /// Stop a running run
    Stop { run_id: String },

    /// Show a run's state
    Status { run_id: String },

    /// List actions, newest first
    Actions {
        run_id: String,

        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,

        /// Only this channel
        #[arg(long)]
        channel: Option<String>,

        /// Only this agent
        #[arg(long)]
        agent: Option<u64>,

        /// Only this round
        #[arg(long)]
        round: Option<u32>,
    },

    /// Per-round activity summary
    Timeline {
        run_id: String,

        #[arg(long)]
        start_round: Option<u32>,

        #[arg(long)]
        end_round: Option<u32>,
    },

    /// Per-agent statistics
    Agents { run_id: String },

    /// List runs with a live worker
    List,

    /// Check that the daemon is up
    Health,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:7700".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    let requires_daemon = !matches!(cli.command, Command::Health);
    if requires_daemon {
        if let Err(e) = client.wait_for_ready().await {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }

    let result = match cli.command {
        Command::Start { run_id, platform } => run_start(&client, &run_id, &platform).await,
        Command::Stop { run_id } => run_stop(&client, &run_id).await,
        Command::Status { run_id } => run_status(&client, &run_id).await,
        Command::Actions {
            run_id,
            limit,
            offset,
            channel,
            agent,
            round,
        } => {
            let query = ActionsQuery {
                limit: Some(limit),
                offset: Some(offset),
                channel,
                actor_id: agent,
                round,
            };
            run_actions(&client, &run_id, &query).await
        }
        Command::Timeline {
            run_id,
            start_round,
            end_round,
        } => run_timeline(&client, &run_id, start_round, end_round).await,
        Command::Agents { run_id } => run_agents(&client, &run_id).await,
        Command::List => run_list(&client).await,
        Command::Health => run_health(&client).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run_start(client: &Client, run_id: &str, platform: &str) -> Result<(), ClientError> {
    let run = client.start_run(run_id, platform).await?;
    println!("Started run: {}", run.state.run_id);
    println!("  Platform: {}", run.state.platform.as_str());
    println!("  Rounds:   {}", run.state.total_rounds);
    if let Some(pid) = run.state.process_pid {
        println!("  PID:      {pid}");
    }
    println!("  Status:   {}", render::format_status(run.state.status));
    Ok(())
}

async fn run_stop(client: &Client, run_id: &str) -> Result<(), ClientError> {
    let run = client.stop_run(run_id).await?;
    println!(
        "Run {} {}",
        run_id,
        render::format_status(run.state.status).to_lowercase()
    );
    Ok(())
}

async fn run_status(client: &Client, run_id: &str) -> Result<(), ClientError> {
    let run = client.get_run(run_id).await?;
    render::print_run_details(&run);
    Ok(())
}

async fn run_actions(client: &Client, run_id: &str, query: &ActionsQuery) -> Result<(), ClientError> {
    let actions = client.get_actions(run_id, query).await?;
    render::print_actions(&actions);
    Ok(())
}

async fn run_timeline(
    client: &Client,
    run_id: &str,
    start_round: Option<u32>,
    end_round: Option<u32>,
) -> Result<(), ClientError> {
    let rounds = client.get_timeline(run_id, start_round, end_round).await?;
    render::print_timeline(&rounds);
    Ok(())
}

async fn run_agents(client: &Client, run_id: &str) -> Result<(), ClientError> {
    let stats = client.get_agents(run_id).await?;
    render::print_agents(&stats);
    Ok(())
}

async fn run_list(client: &Client) -> Result<(), ClientError> {
    let run_ids = client.list_active_runs().await?;
    render::print_active_runs(&run_ids);
    Ok(())
}

async fn run_health(client: &Client) -> Result<(), ClientError> {
    if client.check_health().await? {
        println!("simd is healthy at {}", client.addr());
        Ok(())
    } else {
        Err(ClientError::DaemonNotReady {
            addr: client.addr().to_string(),
            timeout_ms: 0,
        })
    }
}
