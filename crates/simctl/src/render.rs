//! Output rendering for simctl.

use sim_core::aggregate::{ActorStats, RoundSummary};
use sim_core::{ActionRecord, RunSnapshot, RunStatus};

/// Print detailed information about a run.
pub fn print_run_details(run: &RunSnapshot) {
    let state = &run.state;
    println!("Run: {}", state.run_id);
    println!();
    println!("  Status:         {}", format_status(state.status));
    println!("  Platform:       {}", state.platform.as_str());
    println!(
        "  Progress:       round {}/{} ({:.1}%)",
        state.current_round, state.total_rounds, run.progress_percent
    );
    println!(
        "  Simulated:      {:.1}h of {:.1}h",
        run.simulated_hours, state.total_simulation_hours
    );
    println!("  Actions:        {}", run.total_actions_count);
    if let Some(pid) = state.process_pid {
        println!("  Worker PID:     {pid}");
    }
    if let Some(started) = &state.started_at {
        println!("  Started:        {}", format_time(started));
    }
    println!("  Updated:        {}", format_time(&state.updated_at));
    if let Some(completed) = &state.completed_at {
        println!("  Completed:      {}", format_time(completed));
    }
    if let Some(error) = &state.error {
        println!("  Error:          {}", first_line(error));
    }

    if !state.channels.is_empty() {
        println!();
        println!("  Channels:");
        println!("    {:<16}  {:<8}  {:>8}", "CHANNEL", "ACTIVE", "ACTIONS");
        println!("    {}", "-".repeat(36));
        for (name, channel) in &state.channels {
            println!(
                "    {:<16}  {:<8}  {:>8}",
                truncate(name, 16),
                if channel.active { "yes" } else { "no" },
                channel.actions_count
            );
        }
    }
}

/// Print actions, newest first, in tabular format.
pub fn print_actions(actions: &[ActionRecord]) {
    if actions.is_empty() {
        println!("No actions found.");
        return;
    }

    println!(
        "{:<20}  {:>5}  {:<10}  {:<20}  {:<20}  {}",
        "TIME", "ROUND", "CHANNEL", "AGENT", "ACTION", "OK"
    );
    println!("{}", "-".repeat(90));
    for action in actions {
        println!(
            "{:<20}  {:>5}  {:<10}  {:<20}  {:<20}  {}",
            truncate(&action.timestamp, 20),
            action.round,
            truncate(&action.channel, 10),
            truncate(&format!("{}#{}", action.actor_name, action.actor_id), 20),
            truncate(&action.action_type, 20),
            if action.success { "yes" } else { "no" },
        );
    }
    println!();
    println!("{} action(s)", actions.len());
}

/// Print per-round summaries.
pub fn print_timeline(rounds: &[RoundSummary]) {
    if rounds.is_empty() {
        println!("No rounds recorded.");
        return;
    }

    println!(
        "{:>5}  {:>7}  {:>6}  {:<30}  {}",
        "ROUND", "ACTIONS", "AGENTS", "CHANNELS", "TOP ACTION"
    );
    println!("{}", "-".repeat(80));
    for round in rounds {
        let channels = round
            .channel_actions
            .iter()
            .map(|(name, count)| format!("{name}={count}"))
            .collect::<Vec<_>>()
            .join(" ");
        let top = round
            .action_types
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map_or_else(|| "-".to_string(), |(name, count)| format!("{name} ({count})"));
        println!(
            "{:>5}  {:>7}  {:>6}  {:<30}  {}",
            round.round_num,
            round.total_actions,
            round.active_agents_count,
            truncate(&channels, 30),
            top
        );
    }
}

/// Print per-agent statistics.
pub fn print_agents(stats: &[ActorStats]) {
    if stats.is_empty() {
        println!("No agent activity.");
        return;
    }

    println!(
        "{:>8}  {:<20}  {:>7}  {:<20}  {:<20}",
        "ID", "NAME", "ACTIONS", "FIRST", "LAST"
    );
    println!("{}", "-".repeat(83));
    for agent in stats {
        println!(
            "{:>8}  {:<20}  {:>7}  {:<20}  {:<20}",
            agent.agent_id,
            truncate(&agent.agent_name, 20),
            agent.total_actions,
            truncate(&agent.first_action_time, 20),
            truncate(&agent.last_action_time, 20),
        );
    }
    println!();
    println!("{} agent(s)", stats.len());
}

/// Print active run ids.
pub fn print_active_runs(run_ids: &[String]) {
    if run_ids.is_empty() {
        println!("No active runs.");
        return;
    }
    for run_id in run_ids {
        println!("{run_id}");
    }
    println!();
    println!("{} active run(s)", run_ids.len());
}

pub fn format_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Idle => "IDLE",
        RunStatus::Starting => "STARTING",
        RunStatus::Running => "RUNNING",
        RunStatus::Paused => "PAUSED",
        RunStatus::Stopping => "STOPPING",
        RunStatus::Stopped => "STOPPED",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Failed => "FAILED",
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
