use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyglow::config::AppConfig;
use keyglow::runtime::{RuntimeCommand, VisualizerRuntime};
use keyglow::simulator::MidiSimulator;
use keyglow::telemetry::LatencyWindow;
use keyglow::visualizer::VisualizerEvent;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

#[derive(Parser, Debug)]
#[command(
    name = "keyglow_cli",
    about = "Headless driver for the keyglow MIDI piano visualizer"
)]
struct Cli {
    /// Config file (defaults to assets/keyglow_config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the MIDI source endpoint
    #[arg(long, global = true)]
    url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and stream visualizer events to stdout as JSON lines
    Watch {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        seconds: Option<u64>,
        /// Print performance_update events
        #[arg(long)]
        reports: bool,
        /// Serve /health and /api/status (debug_http builds only)
        #[arg(long)]
        debug_http: bool,
    },
    /// Measure round-trip time to the MIDI source
    Ping {
        #[arg(long, default_value_t = 5)]
        count: usize,
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Serve a simulated MIDI source
    Simulate {
        #[arg(long, default_value = "127.0.0.1:8765")]
        bind: String,
        /// Play the C-major scale once a client connects
        #[arg(long)]
        scale: bool,
        /// Play this many random notes once a client connects
        #[arg(long)]
        random: Option<usize>,
        /// Keep replaying the sequence until Ctrl-C
        #[arg(long)]
        repeat: bool,
    },
}

fn main() -> ExitCode {
    keyglow::init_logging("info");
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path),
        None => AppConfig::load(),
    };
    if let Some(url) = cli.url {
        config.channel.url = url;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Commands::Watch {
            seconds,
            reports,
            debug_http,
        } => {
            config
                .validate()
                .map_err(anyhow::Error::msg)
                .context("invalid configuration")?;
            runtime.block_on(run_watch(&config, seconds, reports, debug_http))
        }
        Commands::Ping {
            count,
            interval_ms,
            timeout_secs,
        } => runtime.block_on(run_ping(
            &config,
            count,
            Duration::from_millis(interval_ms),
            Duration::from_secs(timeout_secs),
        )),
        Commands::Simulate {
            bind,
            scale,
            random,
            repeat,
        } => runtime.block_on(run_simulate(&bind, scale, random, repeat)),
    }
}

fn shutdown_on_ctrl_c(commands: mpsc::UnboundedSender<RuntimeCommand>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = commands.send(RuntimeCommand::Shutdown);
        }
    });
}

fn print_event(event: &VisualizerEvent, reports: bool) -> Result<()> {
    if !reports && matches!(event, VisualizerEvent::PerformanceUpdate { .. }) {
        return Ok(());
    }
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

async fn run_watch(
    config: &AppConfig,
    seconds: Option<u64>,
    reports: bool,
    debug_http: bool,
) -> Result<ExitCode> {
    let runtime = VisualizerRuntime::new(config);
    let commands = runtime.commands();
    let mut events = runtime.event_receiver();

    if debug_http && !keyglow::http::is_available() {
        tracing::warn!("--debug-http ignored: built without the debug_http feature");
    } else if debug_http {
        keyglow::http::spawn_if_enabled(
            runtime.snapshot_watch(),
            runtime.visualizer().event_sender(),
        );
    }

    shutdown_on_ctrl_c(commands.clone());
    if let Some(seconds) = seconds {
        let commands = commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            let _ = commands.send(RuntimeCommand::Shutdown);
        });
    }

    let driver = runtime.run();
    tokio::pin!(driver);
    let outcome = loop {
        tokio::select! {
            biased;
            outcome = &mut driver => break outcome,
            received = events.recv() => match received {
                Ok(event) => print_event(&event, reports)?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
        }
    };
    while let Ok(event) = events.try_recv() {
        print_event(&event, reports)?;
    }
    drop(commands);

    outcome?;
    Ok(ExitCode::from(0))
}

#[derive(Serialize)]
struct PingReport<'a> {
    url: &'a str,
    sent: usize,
    received: usize,
    min_ms: f64,
    max_ms: f64,
    median_ms: f64,
    average_ms: f64,
}

async fn run_ping(
    config: &AppConfig,
    count: usize,
    interval: Duration,
    timeout: Duration,
) -> Result<ExitCode> {
    let mut runtime = VisualizerRuntime::new(config);
    let commands = runtime.commands();
    let mut events = runtime.event_receiver();

    let (rtt_tx, mut rtt_rx) = mpsc::unbounded_channel();
    runtime
        .visualizer_mut()
        .channel_mut()
        .on_round_trip(move |rtt| {
            let _ = rtt_tx.send(*rtt);
        });

    let mut samples = LatencyWindow::new(count.max(1));
    let probe = async {
        loop {
            match events.recv().await {
                Ok(VisualizerEvent::MidiConnected) => break,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
        for _ in 0..count {
            let _ = commands.send(RuntimeCommand::Ping);
            tokio::time::sleep(interval).await;
        }
        while samples.len() < count {
            match rtt_rx.recv().await {
                Some(rtt) => samples.observe(rtt),
                None => break,
            }
        }
    };

    let driver = runtime.run();
    tokio::pin!(driver);
    let driver_outcome = {
        let timed_probe = tokio::time::timeout(timeout, probe);
        tokio::pin!(timed_probe);
        tokio::select! {
            outcome = &mut driver => Some(outcome),
            finished = &mut timed_probe => {
                if finished.is_err() {
                    tracing::warn!("ping timed out after {:?}", timeout);
                }
                None
            }
        }
    };
    if let Some(outcome) = driver_outcome {
        outcome?;
    } else {
        let _ = commands.send(RuntimeCommand::Shutdown);
        driver.await?;
    }
    while let Ok(rtt) = rtt_rx.try_recv() {
        samples.observe(rtt);
    }

    let stats = samples.stats();
    let report = PingReport {
        url: &config.channel.url,
        sent: count,
        received: stats.sample_count,
        min_ms: stats.min_ms,
        max_ms: stats.max_ms,
        median_ms: stats.median_ms,
        average_ms: stats.average_ms,
    };
    println!("{}", serde_json::to_string(&report)?);

    if stats.sample_count == 0 {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::from(0))
}

async fn run_simulate(
    bind: &str,
    scale: bool,
    random: Option<usize>,
    repeat: bool,
) -> Result<ExitCode> {
    let simulator = MidiSimulator::bind(bind)
        .await
        .with_context(|| format!("binding simulator on {}", bind))?;
    println!("{}", serde_json::json!({ "listening": simulator.url() }));

    let has_sequence = scale || random.is_some();
    let playback = async {
        if !has_sequence {
            return std::future::pending::<()>().await;
        }
        loop {
            while simulator.client_count() == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if scale {
                simulator.play_scale().await;
            }
            if let Some(count) = random {
                simulator.play_random(count).await;
            }
            if !repeat {
                break;
            }
        }
        std::future::pending::<()>().await
    };

    tokio::select! {
        _ = playback => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
        }
    }

    simulator.shutdown().await;
    Ok(ExitCode::from(0))
}
