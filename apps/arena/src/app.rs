use anyhow::{Context, Result, anyhow, bail};
use arena_lab::bootstrap::{BootstrapOptions, BootstrapPhase, LabSession, LabSnapshot};
use arena_lab::cli::{CatArgs, Cli, Command, LabArgs, RunArgs, TestArgs};
use arena_lab::config::LabConfig;
use arena_lab::telemetry::logging;
use arena_lab::tree::{Children, FileTree};
use std::fmt::Write as _;
use std::io::Write as _;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

pub async fn run(cli: Cli) -> Result<()> {
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("failed to configure logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = LabConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply_overrides(&mut config);

    match cli.command {
        Command::Up(lab) => up(&config, lab, true).await,
        Command::Tree(lab) => up(&config, lab, false).await,
        Command::Cat(args) => cat(&config, args).await,
        Command::Test(args) => test(&config, args).await,
        Command::Run(args) => run_project(&config, args).await,
    }
}

fn options(lab: &LabArgs, needs_pty: bool) -> BootstrapOptions {
    let mut options = BootstrapOptions::new(&lab.lab, &lab.language);
    let require_pty = needs_pty || !lab.no_pty;
    options.require_pty_for_ready = require_pty;
    options.auto_connect_pty = require_pty;
    options
}

async fn boot(config: &LabConfig, options: BootstrapOptions, verbose: bool) -> Result<(LabSession, LabSnapshot)> {
    let session = LabSession::from_config(config, options).context("invalid lab configuration")?;
    match wait_until_ready(&session, verbose).await {
        Ok(snapshot) => Ok((session, snapshot)),
        Err(err) => {
            session.shutdown();
            Err(err)
        }
    }
}

async fn wait_until_ready(session: &LabSession, verbose: bool) -> Result<LabSnapshot> {
    let mut updates = session.subscribe();
    let mut bootstrap = session.start();
    let mut bootstrap_done = false;
    let mut last = None;
    loop {
        let snapshot = updates.borrow_and_update().clone();
        if verbose && last != Some((snapshot.phase, snapshot.percent)) {
            eprintln!("[{:>3}%] {}", snapshot.percent, snapshot.phase);
            last = Some((snapshot.phase, snapshot.percent));
        }
        if snapshot.is_ready() {
            if let Some(issue) = &snapshot.error {
                eprintln!("⚠️  {issue}");
            }
            return Ok(snapshot);
        }
        if snapshot.phase == BootstrapPhase::Error {
            let issue = snapshot
                .error
                .map(|issue| issue.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            bail!("lab bootstrap failed: {issue}");
        }
        tokio::select! {
            changed = updates.changed() => changed.context("lab session closed")?,
            finished = &mut bootstrap, if !bootstrap_done => {
                bootstrap_done = true;
                finished
                    .context("bootstrap task panicked")?
                    .context("lab bootstrap failed")?;
            }
        }
    }
}

async fn up(config: &LabConfig, lab: LabArgs, verbose: bool) -> Result<()> {
    let (session, snapshot) = boot(config, options(&lab, false), verbose).await?;
    let tree = session.files().tree();
    print!("{}", render_tree(&tree));
    if verbose {
        if let Some(active) = &snapshot.active_file {
            eprintln!("active file: {active}");
        }
    }
    session.shutdown();
    Ok(())
}

async fn cat(config: &LabConfig, args: CatArgs) -> Result<()> {
    let mut options = options(&args.lab, false);
    options.require_pty_for_ready = false;
    options.auto_connect_pty = false;
    let (session, _) = boot(config, options, false).await?;
    let content = session
        .open_file(&args.path)
        .await
        .with_context(|| format!("failed to read {}", args.path));
    session.shutdown();
    print!("{}", content?);
    Ok(())
}

async fn test(config: &LabConfig, args: TestArgs) -> Result<()> {
    let (session, _) = boot(config, options(&args.lab, true), false).await?;
    let outcome = session.run_checkpoint_test(&args.checkpoint).await;
    let result = session.exec().latest_result(&args.checkpoint);
    session.shutdown();
    outcome.with_context(|| format!("checkpoint {} did not complete", args.checkpoint))?;

    let result = result.ok_or_else(|| anyhow!("runner reported no result for checkpoint {}", args.checkpoint))?;
    if result.passed {
        println!(
            "✅ checkpoint {} {}",
            result.checkpoint_id,
            result.output.as_deref().unwrap_or("passed")
        );
        return Ok(());
    }
    println!("❌ checkpoint {} {}", result.checkpoint_id, result.status);
    if let Some(detail) = &result.error {
        for (label, value) in [
            ("scenario", &detail.scenario),
            ("expected", &detail.expected),
            ("received", &detail.received),
            ("hint", &detail.hint),
            ("message", &detail.message),
        ] {
            if let Some(value) = value {
                println!("   {label}: {value}");
            }
        }
    }
    bail!("checkpoint {} failed", result.checkpoint_id)
}

async fn run_project(config: &LabConfig, args: RunArgs) -> Result<()> {
    let (session, _) = boot(config, options(&args.lab, true), false).await?;
    let mut output = session.exec().subscribe_output();
    if let Err(err) = session.exec().run_project(&args.init, &args.command) {
        session.shutdown();
        return Err(err).context("failed to start the project");
    }

    let limit = args.duration.map(Duration::from_secs);
    let streamed = tokio::select! {
        streamed = stream_output(&mut output) => streamed,
        _ = tokio::signal::ctrl_c() => Ok(()),
        _ = sleep_or_forever(limit) => Ok(()),
    };
    let run = session.exec().snapshot().run;
    session.shutdown();
    streamed?;
    if let Some(url) = run.server_url {
        eprintln!("server: {url}");
    }
    match run.error {
        Some(error) => bail!("project run failed: {error}"),
        None => Ok(()),
    }
}

async fn stream_output(output: &mut broadcast::Receiver<String>) -> Result<()> {
    let mut stdout = std::io::stdout();
    loop {
        match output.recv().await {
            Ok(chunk) => {
                stdout.write_all(chunk.as_bytes()).context("failed to write output")?;
                stdout.flush().context("failed to flush output")?;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "terminal output lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

async fn sleep_or_forever(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

fn render_tree(tree: &FileTree) -> String {
    let mut out = String::new();
    render_level(tree.root(), 0, &mut out);
    out
}

fn render_level(children: &Children, depth: usize, out: &mut String) {
    for (name, node) in children {
        let marker = if node.is_dir() { "/" } else { "" };
        let _ = writeln!(out, "{}{name}{marker}", "  ".repeat(depth));
        if let Some(children) = node.children() {
            render_level(children, depth + 1, out);
        }
    }
}
