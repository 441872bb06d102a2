//! Command handlers - thin glue between the CLI and the library.

use std::sync::Arc;
use std::time::Duration;

use colored::*;
use eyre::{Context, Result, bail};
use log::info;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::{broadcast, watch};

use super::commands::{Cli, Commands, QueueCommands};
use crate::config::{GlobalConfig, load_loop_file};
use crate::daemon::{AgentFilter, Daemon, DaemonConfig, SpecialKey};
use crate::domain::{
    LoopConfig, LoopRecord, LoopState, OutputMode, OwnerKind, QueueItem, QueueItemStatus, QueueItemType, StopRule,
};
use crate::id::{generate_instance_id, now_ms};
use crate::ipc::{IpcClient, IpcClientConfig};
use crate::ownership::{DaemonLink, IpcDaemonLink, OwnershipResolver, SpawnOwner};
use crate::recovery::{RECLAIMED_REASON, StaleRunnerDetector, SweepResult};
use crate::runner::{LoopRunner, RunnerEvent, RunnerOutcome, ShellExecutor};
use crate::store::Store;

const DEFAULT_STOP_REASON: &str = "stopped by user";

/// Everything a handler needs.
pub struct App {
    config: GlobalConfig,
    store: Arc<Store>,
    json: bool,
    quiet: bool,
}

impl App {
    pub fn open(config: GlobalConfig, json: bool, quiet: bool) -> Result<Self> {
        let db_path = config.db_path();
        let store = Store::open_at(&db_path).context(format!("Failed to open store at {}", db_path.display()))?;
        Ok(Self {
            config,
            store: Arc::new(store),
            json,
            quiet,
        })
    }

    /// Human output only when neither --json nor --quiet is set.
    fn chatty(&self) -> bool {
        !self.json && !self.quiet
    }

    fn link(&self) -> IpcDaemonLink {
        IpcDaemonLink::new(self.config.socket_path())
            .with_probe_timeout(Duration::from_millis(self.config.daemon.probe_timeout_ms))
            .with_request_timeout(Duration::from_millis(self.config.daemon.request_timeout_ms))
    }

    fn resolver(&self) -> OwnershipResolver {
        OwnershipResolver::new(
            Arc::clone(&self.store),
            Arc::new(self.link()),
            generate_instance_id("local"),
            self.config.stale_config().threshold,
        )
    }

    async fn client(&self) -> Result<IpcClient> {
        let client = IpcClient::new(IpcClientConfig {
            socket_path: self.config.socket_path(),
            connect_timeout_ms: self.config.daemon.probe_timeout_ms,
            request_timeout_ms: self.config.daemon.request_timeout_ms,
        });
        client.connect().await?;
        Ok(client)
    }
}

/// Dispatch a parsed command line.
pub async fn run(cli: Cli, config: GlobalConfig) -> Result<()> {
    let app = App::open(config, cli.json, cli.quiet)?;
    if cli.is_verbose() && app.chatty() {
        println!("{} {}", "Store:".dimmed(), app.store.path().display());
    }

    match cli.command {
        Commands::Daemon { socket } => handle_daemon(&app, socket).await,
        Commands::Up {
            name,
            file,
            workdir,
            timeout,
            max_iterations,
            max_runtime,
            interval,
            stop_on_exit,
            stop_on_stdout,
            auto_restart,
            owner,
            no_start,
            command,
        } => {
            let mut config = match &file {
                Some(path) => load_loop_file(path)?,
                None => LoopConfig::default(),
            };
            if !command.is_empty() {
                config.command = command.join(" ");
            }
            if workdir.is_some() {
                config.working_dir = workdir;
            }
            if let Some(secs) = timeout {
                config.timeout_secs = secs;
            }
            if let Some(n) = max_iterations {
                config.max_iterations = n;
            }
            if let Some(secs) = max_runtime {
                config.max_runtime_secs = secs;
            }
            if let Some(secs) = interval {
                config.interval_secs = secs;
            }
            if auto_restart {
                config.auto_restart = Some(true);
            }
            if !stop_on_exit.is_empty() || stop_on_stdout.is_some() {
                config.stop_rules.push(StopRule {
                    name: Some("cli".to_string()),
                    exit_codes: stop_on_exit,
                    stdout_mode: if stop_on_stdout.is_some() {
                        OutputMode::Regex
                    } else {
                        OutputMode::Any
                    },
                    stdout_regex: stop_on_stdout,
                    ..Default::default()
                });
            }
            handle_up(&app, &name, config, owner, no_start).await
        }
        Commands::Run { loop_ref, owner } => {
            let record = app.store.loops().resolve(&loop_ref)?;
            start_loop(&app, &record, owner).await
        }
        Commands::Ps { state } => handle_ps(&app, state),
        Commands::Status { loop_ref, iterations } => handle_status(&app, &loop_ref, iterations),
        Commands::Queue { command } => handle_queue(&app, command),
        Commands::Resume { loop_ref } => handle_resume(&app, &loop_ref),
        Commands::Stop { loop_ref, reason } => handle_stop(&app, &loop_ref, reason.as_deref()).await,
        Commands::Rm { loop_ref } => handle_rm(&app, &loop_ref),
        Commands::Sweep { restart } => handle_sweep(&app, restart).await,
        Commands::Ping => handle_ping(&app).await,
        Commands::Send { agent_id, text, keys } => handle_send(&app, &agent_id, text.as_deref(), &keys).await,
        Commands::Agents {
            agent_id,
            states,
            workspace,
        } => handle_agents(&app, agent_id.as_deref(), states, workspace).await,
    }
}

async fn handle_daemon(app: &App, socket: Option<std::path::PathBuf>) -> Result<()> {
    let config = DaemonConfig {
        socket_path: socket.unwrap_or_else(|| app.config.socket_path()),
        runner: app.config.runner_config(),
        stale: app.config.stale_config(),
        shutdown_grace: Duration::from_secs(app.config.daemon.shutdown_grace_secs),
    };
    let socket_path = config.socket_path.clone();
    let daemon = Daemon::new(Arc::clone(&app.store), config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down daemon");
            let _ = shutdown_tx.send(true);
        }
    });

    if app.chatty() {
        println!("{} listening on {}", "loopd daemon".green(), socket_path.display());
    }
    daemon.run(shutdown_rx).await?;
    Ok(())
}

async fn handle_up(
    app: &App,
    name: &str,
    config: LoopConfig,
    owner: Option<SpawnOwner>,
    no_start: bool,
) -> Result<()> {
    let record = app.store.loops().create(name, config)?;
    if app.json && no_start {
        return print_json(&record);
    }
    if app.chatty() {
        println!("{} {} ({})", "Created".green(), record.name.bold(), record.short_id);
    }
    if no_start {
        return Ok(());
    }
    start_loop(app, &record, owner).await
}

/// Resolve an owner for `record`; a local owner drives it in the foreground.
async fn start_loop(app: &App, record: &LoopRecord, owner: Option<SpawnOwner>) -> Result<()> {
    let requested = owner.or(app.config.ownership.default_mode);
    let resolution = app.resolver().resolve(&record.id, requested).await?;

    if let Some(warning) = &resolution.warning
        && app.chatty()
    {
        eprintln!("{} {}", "warning:".yellow().bold(), warning);
    }

    match resolution.owner {
        OwnerKind::Daemon => {
            if app.json {
                return print_json(&json!({
                    "loop_id": record.id,
                    "owner": OwnerKind::Daemon,
                    "instance_id": resolution.instance_id,
                }));
            }
            if !app.quiet {
                println!(
                    "{} {} handed to daemon {}",
                    "Started".green(),
                    record.name.bold(),
                    resolution.instance_id
                );
            }
            Ok(())
        }
        OwnerKind::Local => drive_local(app, record, &resolution.instance_id).await,
    }
}

async fn drive_local(app: &App, record: &LoopRecord, instance_id: &str) -> Result<()> {
    let (events_tx, mut events_rx) = broadcast::channel(64);
    let runner = LoopRunner::new(
        Arc::clone(&app.store),
        Arc::new(ShellExecutor::new()),
        &record.id,
        instance_id,
        app.config.runner_config(),
    )?
    .with_events(events_tx);

    let control = runner.control();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping after the current iteration");
            control.request_stop();
        }
    });

    let chatty = app.chatty();
    let printer = tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) if chatty => print_runner_event(&event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if chatty {
        println!(
            "{} {} locally as {} (Ctrl-C to stop)",
            "Running".green(),
            record.name.bold(),
            instance_id
        );
    }
    let outcome = runner.run().await;
    ctrl_c.abort();
    let _ = printer.await;
    let outcome = outcome?;

    if app.json {
        print_json(&outcome)?;
    } else if !app.quiet {
        match &outcome {
            RunnerOutcome::Stopped { .. } => println!("{} {}", record.name.bold(), outcome.to_string().green()),
            RunnerOutcome::Failed { .. } => println!("{} {}", record.name.bold(), outcome.to_string().red()),
        }
    }
    if let RunnerOutcome::Failed { error } = outcome {
        bail!("loop {} failed: {}", record.name, error);
    }
    Ok(())
}

fn print_runner_event(event: &RunnerEvent) {
    match event {
        RunnerEvent::StateChanged { state, .. } => {
            println!("  {} {}", "state".dimmed(), colored_state(*state));
        }
        RunnerEvent::IterationCompleted {
            sequence,
            exit_code,
            decision,
            ..
        } => {
            let decision = if decision.is_stop() {
                decision.to_string().yellow()
            } else {
                decision.to_string().normal()
            };
            println!("  #{:<4} exit {:>4}  {}", sequence, exit_code, decision);
        }
    }
}

fn handle_ps(app: &App, state: Option<LoopState>) -> Result<()> {
    let records = match state {
        Some(state) => app.store.loops().list_by_state(state)?,
        None => app.store.loops().list()?,
    };
    if app.json {
        return print_json(&records);
    }
    if records.is_empty() {
        if !app.quiet {
            println!("{}", "No loops".dimmed());
        }
        return Ok(());
    }

    let now = now_ms();
    println!(
        "{:<10} {:<20} {:<10} {:>6}  {:<28} {}",
        "ID".bold(),
        "NAME".bold(),
        "STATE".bold(),
        "ITER".bold(),
        "OWNER".bold(),
        "HEARTBEAT".bold()
    );
    for record in records {
        let heartbeat = record
            .heartbeat_age_ms(now)
            .map(|age| format!("{} ago", format_age(age)))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<20} {:<10} {:>6}  {:<28} {}",
            record.short_id,
            record.name,
            colored_state(record.state),
            record.iteration_count,
            record.owner_label(),
            heartbeat
        );
    }
    Ok(())
}

fn handle_status(app: &App, loop_ref: &str, count: usize) -> Result<()> {
    let record = app.store.loops().resolve(loop_ref)?;
    let history = app.store.iterations().list(&record.id)?;
    let recent: Vec<_> = history.iter().skip(history.len().saturating_sub(count)).collect();
    let pending = app
        .store
        .queue()
        .list_by_status(&record.id, QueueItemStatus::Pending)?
        .len();

    if app.json {
        return print_json(&json!({
            "loop": record,
            "pending_items": pending,
            "iterations": recent,
        }));
    }

    let now = now_ms();
    println!("{} {} ({})", "Loop".bold(), record.name.bold(), record.id);
    println!("  state:      {}", colored_state(record.state));
    println!("  command:    {}", record.config.command);
    println!("  iterations: {}", record.iteration_count);
    println!("  owner:      {}", record.owner_label());
    if let Some(age) = record.heartbeat_age_ms(now) {
        println!("  heartbeat:  {} ago", format_age(age));
    }
    if let Some(started) = record.started_at {
        println!("  started:    {}", format_time(started));
    }
    if let Some(reason) = &record.stop_reason {
        println!("  stopped:    {}", reason);
    }
    if let Some(error) = &record.last_error {
        println!("  error:      {}", error.red());
    }
    println!("  queued:     {}", pending);

    if !recent.is_empty() {
        println!("{}", "Recent iterations".bold());
        for it in recent {
            println!(
                "  #{:<4} {}  exit {:>4}{}  {:>6}ms  {}",
                it.sequence,
                format_time(it.started_at),
                it.exit_code,
                if it.timed_out { " (timeout)" } else { "" },
                it.duration_ms(),
                it.decision
            );
        }
    }
    Ok(())
}

/// Build the untyped payload fields for `queue add`.
#[allow(clippy::too_many_arguments)]
fn queue_fields(
    item_type: QueueItemType,
    text: Option<String>,
    duration: Option<u64>,
    reason: Option<String>,
    predicate: Option<String>,
    when_cmd: Option<String>,
    not_before: Option<i64>,
    replicas: Option<u32>,
) -> Value {
    let mut fields = Map::new();
    match item_type {
        QueueItemType::Message => {
            fields.insert("text".into(), json!(text));
        }
        QueueItemType::Pause => {
            fields.insert("duration_secs".into(), json!(duration));
            fields.insert("reason".into(), json!(reason));
        }
        QueueItemType::Conditional => {
            let (condition, described) = match (when_cmd, not_before) {
                (Some(cmd), _) => (json!({"when": "command", "cmd": cmd}), format!("`{cmd}` succeeds")),
                (None, Some(at_ms)) => (
                    json!({"when": "not_before", "at_ms": at_ms}),
                    format!("not before {}", format_time(at_ms)),
                ),
                (None, None) => (json!({"when": "manual"}), "manual resume".to_string()),
            };
            fields.insert("predicate".into(), json!(predicate.unwrap_or(described)));
            fields.insert("condition".into(), condition);
            fields.insert("message".into(), json!(text));
        }
        QueueItemType::Scale => {
            fields.insert("replicas".into(), json!(replicas));
        }
        QueueItemType::Stop => {
            fields.insert("reason".into(), json!(reason));
        }
    }
    Value::Object(fields)
}

fn handle_queue(app: &App, command: QueueCommands) -> Result<()> {
    match command {
        QueueCommands::Add {
            loop_ref,
            item_type,
            text,
            duration,
            reason,
            predicate,
            when_cmd,
            not_before,
            replicas,
        } => {
            let record = app.store.loops().resolve(&loop_ref)?;
            let fields = queue_fields(item_type, text, duration, reason, predicate, when_cmd, not_before, replicas);
            let item = app.store.queue().enqueue(&record.id, item_type, &fields)?;
            if app.json {
                return print_json(&item);
            }
            if !app.quiet {
                println!("{} {} {} at position {}", "Queued".green(), item_type, item.id, item.position);
            }
        }
        QueueCommands::Ls { loop_ref, all } => {
            let record = app.store.loops().resolve(&loop_ref)?;
            let items: Vec<QueueItem> = app
                .store
                .queue()
                .list(&record.id)?
                .into_iter()
                .filter(|item| all || !item.status.is_terminal())
                .collect();
            if app.json {
                return print_json(&items);
            }
            if items.is_empty() && !app.quiet {
                println!("{}", "Queue empty".dimmed());
            }
            for item in items {
                let payload = serde_json::to_string(&item.payload)?;
                println!(
                    "{:>4}  {:<24} {:<11} {:<10} {}",
                    item.position,
                    item.id,
                    item.item_type().to_string(),
                    item.status.to_string(),
                    payload.dimmed()
                );
            }
        }
        QueueCommands::Rm { item_id } => {
            app.store.queue().remove(&item_id)?;
            if app.chatty() {
                println!("{} {}", "Removed".green(), item_id);
            }
        }
        QueueCommands::Clear { loop_ref } => {
            let record = app.store.loops().resolve(&loop_ref)?;
            let removed = app.store.queue().clear(&record.id)?;
            if app.json {
                return print_json(&json!({"removed": removed}));
            }
            if !app.quiet {
                println!("{} {} pending items", "Cleared".green(), removed);
            }
        }
        QueueCommands::Reorder { loop_ref, item_ids } => {
            let record = app.store.loops().resolve(&loop_ref)?;
            app.store.queue().reorder(&record.id, &item_ids)?;
            if app.chatty() {
                println!("{} {} items", "Reordered".green(), item_ids.len());
            }
        }
    }
    Ok(())
}

fn handle_resume(app: &App, loop_ref: &str) -> Result<()> {
    let record = app.store.loops().resolve(loop_ref)?;
    let resumed = app.store.queue().resume(&record.id)?;
    if app.json {
        return print_json(&json!({"loop_id": record.id, "resumed": resumed}));
    }
    if !app.quiet {
        match resumed {
            Some(item) => println!("{} {} ({})", "Resumed".green(), record.name.bold(), item.item_type()),
            None => println!("{} is not waiting on a pause or condition", record.name),
        }
    }
    Ok(())
}

async fn handle_stop(app: &App, loop_ref: &str, reason: Option<&str>) -> Result<()> {
    let record = app.store.loops().resolve(loop_ref)?;
    let reason = reason.unwrap_or(DEFAULT_STOP_REASON);
    let now = now_ms();
    let threshold_ms = app.config.stale_config().threshold_ms();

    let how = if record.has_live_owner(now, threshold_ms) {
        let via_daemon = record.owner_kind == Some(OwnerKind::Daemon)
            && match app.link().stop_loop_runner(&record.id).await {
                Ok(stopping) => stopping,
                Err(e) => {
                    info!("Daemon stop for {} failed, queueing a stop item: {}", record.id, e);
                    false
                }
            };
        if via_daemon {
            "daemon asked to stop"
        } else {
            app.store
                .queue()
                .enqueue(&record.id, QueueItemType::Stop, &json!({"reason": reason}))?;
            "stop item queued"
        }
    } else if let Some(owner) = record.owner_instance_id.as_deref() {
        let reclaimed = app.store.loops().reclaim_stale(
            &record.id,
            Some(owner),
            now - threshold_ms + 1,
            LoopState::Stopped,
            RECLAIMED_REASON,
            now,
        )?;
        if reclaimed {
            "stale owner reclaimed"
        } else {
            // Claimed but never started: take it over and release it stopped
            let loops = app.store.loops();
            let instance_id = generate_instance_id("local");
            loops
                .claim_owner(&record.id, OwnerKind::Local, &instance_id, now, threshold_ms)
                .context(format!("loop {} changed owner while stopping; retry", record.name))?;
            loops.release_owner(&record.id, &instance_id, LoopState::Stopped, Some(reason), None, now)?;
            "stale owner released"
        }
    } else if app.store.loops().stop_unowned(&record.id, reason, now)? {
        "stopped"
    } else {
        bail!("loop {} was claimed while stopping; retry", record.name);
    };

    if app.json {
        return print_json(&json!({"loop_id": record.id, "result": how}));
    }
    if !app.quiet {
        println!("{} {}: {}", "Stop".yellow(), record.name.bold(), how);
    }
    Ok(())
}

fn handle_rm(app: &App, loop_ref: &str) -> Result<()> {
    let record = app.store.loops().resolve(loop_ref)?;
    app.store
        .loops()
        .remove(&record.id, now_ms(), app.config.stale_config().threshold_ms())?;
    if app.chatty() {
        println!("{} {}", "Removed".green(), record.name.bold());
    }
    Ok(())
}

async fn handle_sweep(app: &App, restart: bool) -> Result<()> {
    let mut detector = StaleRunnerDetector::new(Arc::clone(&app.store), app.config.stale_config());
    if restart {
        detector = detector.with_restarter(Arc::new(app.resolver()));
    }
    let results = detector.sweep().await?;

    if app.json {
        let rows: Vec<Value> = results.iter().map(sweep_row).collect();
        return print_json(&rows);
    }
    if app.quiet {
        return Ok(());
    }
    if results.is_empty() {
        println!("{}", "No stale loops".dimmed());
    }
    for result in &results {
        match result {
            SweepResult::Reclaimed {
                loop_id,
                previous_owner,
            } => println!("{} {} (was {})", "Reclaimed".yellow(), loop_id, previous_owner),
            SweepResult::Restarted { loop_id, owner, .. } => {
                println!("{} {} under {}", "Restarted".green(), loop_id, owner)
            }
            SweepResult::RestartFailed { loop_id, error } => {
                println!("{} {}: {}", "Restart failed".red(), loop_id, error)
            }
            SweepResult::Raced { loop_id } => println!("{} {}", "Skipped".dimmed(), loop_id),
        }
    }
    Ok(())
}

fn sweep_row(result: &SweepResult) -> Value {
    match result {
        SweepResult::Reclaimed {
            loop_id,
            previous_owner,
        } => json!({"loop_id": loop_id, "result": "reclaimed", "previous_owner": previous_owner}),
        SweepResult::Restarted {
            loop_id,
            previous_owner,
            owner,
        } => json!({"loop_id": loop_id, "result": "restarted", "previous_owner": previous_owner, "owner": owner}),
        SweepResult::RestartFailed { loop_id, error } => {
            json!({"loop_id": loop_id, "result": "restart_failed", "error": error})
        }
        SweepResult::Raced { loop_id } => json!({"loop_id": loop_id, "result": "raced"}),
    }
}

async fn handle_ping(app: &App) -> Result<()> {
    let client = app.client().await?;
    let started = std::time::Instant::now();
    let ping = client.ping().await?;
    let latency = started.elapsed();
    let status = client.status().await?;

    if app.json {
        return print_json(&json!({"ping": ping, "status": status}));
    }
    if !app.quiet {
        println!(
            "{} loopd {} on {} ({} ms)",
            "pong".green(),
            ping.version,
            status.hostname,
            latency.as_millis()
        );
        println!(
            "  instance {}  up {}  health {:?}  loops {}",
            status.instance_id,
            format_age(status.uptime_secs as i64 * 1000),
            status.health,
            status.owned_loop_count
        );
    }
    Ok(())
}

async fn handle_send(app: &App, agent_id: &str, text: Option<&str>, keys: &[SpecialKey]) -> Result<()> {
    let client = app.client().await?;
    let ack = client.send_input(agent_id, text.unwrap_or_default(), keys).await?;
    if app.json {
        return print_json(&ack);
    }
    if !app.quiet {
        println!("{} {} ({} keys)", "Sent".green(), ack.agent_id, ack.keys_sent);
    }
    Ok(())
}

async fn handle_agents(
    app: &App,
    agent_id: Option<&str>,
    states: Vec<LoopState>,
    workspace_id: Option<String>,
) -> Result<()> {
    let client = app.client().await?;

    if let Some(agent_id) = agent_id {
        let detail = client.get_agent(agent_id).await?;
        if app.json {
            return print_json(&detail);
        }
        println!(
            "{} {} ({})",
            detail.summary.agent_id.bold(),
            detail.summary.name,
            colored_state(detail.summary.state)
        );
        println!("  loop:      {}", detail.summary.loop_id);
        println!("  workspace: {}", detail.summary.workspace_id);
        for entry in &detail.transcript {
            println!("  {}", serde_json::to_string(entry)?.dimmed());
        }
        return Ok(());
    }

    let agents = client.list_agents(&AgentFilter { workspace_id, states }).await?;
    if app.json {
        return print_json(&agents);
    }
    if agents.is_empty() && !app.quiet {
        println!("{}", "No agents".dimmed());
    }
    for agent in agents {
        println!(
            "{:<18} {:<20} {:<10} {}",
            agent.agent_id,
            agent.name,
            colored_state(agent.state),
            agent.workspace_id
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn colored_state(state: LoopState) -> ColoredString {
    let label = state.as_str();
    match state {
        LoopState::Running => label.green(),
        LoopState::Paused | LoopState::Stopping => label.yellow(),
        LoopState::Failed => label.red(),
        LoopState::Idle | LoopState::Stopped => label.normal(),
    }
}

fn format_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Compact duration: 42s, 7m, 3h, 2d
fn format_age(ms: i64) -> String {
    let secs = ms.max(0) / 1000;
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QueuePayload;

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(-5), "0s");
        assert_eq!(format_age(42_000), "42s");
        assert_eq!(format_age(7 * 60_000), "7m");
        assert_eq!(format_age(3 * 3_600_000), "3h");
        assert_eq!(format_age(50 * 3_600_000), "2d");
    }

    #[test]
    fn test_queue_fields_parse_into_payloads() {
        let fields = queue_fields(QueueItemType::Pause, None, Some(30), None, None, None, None, None);
        let payload = QueuePayload::from_parts(QueueItemType::Pause, &fields).unwrap();
        assert_eq!(
            payload,
            QueuePayload::Pause {
                duration_secs: Some(30),
                reason: None
            }
        );

        let fields = queue_fields(
            QueueItemType::Conditional,
            Some("go".into()),
            None,
            None,
            None,
            Some("test -f done".into()),
            None,
            None,
        );
        match QueuePayload::from_parts(QueueItemType::Conditional, &fields).unwrap() {
            QueuePayload::Conditional {
                predicate, message, ..
            } => {
                assert!(predicate.contains("test -f done"));
                assert_eq!(message.as_deref(), Some("go"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_queue_fields_missing_required() {
        let fields = queue_fields(QueueItemType::Scale, None, None, None, None, None, None, None);
        assert!(QueuePayload::from_parts(QueueItemType::Scale, &fields).is_err());
    }
}
