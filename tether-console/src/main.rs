//! tether-console: entry point.
//!
//! ```text
//! tether-console uplink                      Stream controller samples
//! tether-console downlink                    Monitor the telemetry bus
//! tether-console send nav-start              Send one control command
//! tether-console stream play                 Watch the vehicle camera
//! tether-console --config <path> ...         Use custom config TOML
//! tether-console --gen-config                Dump default config and exit
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

use tether_core::{
    CameraSettings, ControlCommand, ControllerSampler, DisconnectReason, FrameHandler, LinkEvent,
    LinkEvents, LinkSession, MediaPipelineSupervisor, NeutralDevice, PipelineEvent, PipelineSpec,
    TopicRouter, Waypoint,
};

use tether_console::config::ConsoleConfig;
use tether_console::watchdog::{Decision, Watchdog};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tether-console", about = "Operator console for a tethered vehicle")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tether-console.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream controller samples to the uplink endpoint.
    Uplink {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Samples per second.
        #[arg(long)]
        rate: Option<f64>,
    },
    /// Receive the telemetry bus and log per-topic rates.
    Downlink {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send one control command on the downlink.
    Send {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[command(subcommand)]
        command: SendCommand,
    },
    /// Run a media pipeline until Ctrl-C.
    Stream {
        #[command(subcommand)]
        mode: StreamMode,
    },
}

#[derive(Subcommand, Debug)]
enum SendCommand {
    /// Ask for a full parameter broadcast.
    Snapshot,
    /// Take the current heading as zero.
    ZeroHeading,
    /// Replace the navigation route.
    NavWaypoints {
        /// `lat,lon`; repeat for each waypoint.
        #[arg(long = "waypoint", required = true)]
        waypoints: Vec<Waypoint>,
    },
    NavStart,
    NavStop,
    NavNext,
    NavPrev,
}

#[derive(Subcommand, Debug)]
enum StreamMode {
    /// Display a remote stream.
    Play {
        #[arg(long)]
        source: Option<String>,
    },
    /// Record a remote stream while displaying it.
    Record {
        #[arg(long)]
        source: Option<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Serve the local camera over RTSP (vehicle side).
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", ConsoleConfig::default_toml()?);
        return Ok(());
    }

    let (mut config, source) = ConsoleConfig::load(&cli.config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tether-console v{}", env!("CARGO_PKG_VERSION"));
    source.log();

    match cli.command {
        Some(Command::Uplink { host, port, rate }) => {
            override_endpoint(&mut config.uplink.host, &mut config.uplink.port, host, port);
            if let Some(rate) = rate {
                config.uplink.rate_hz = rate;
            }
            run_uplink(&config).await
        }
        Some(Command::Downlink { host, port }) => {
            override_endpoint(&mut config.downlink.host, &mut config.downlink.port, host, port);
            run_downlink(&config).await
        }
        Some(Command::Send {
            host,
            port,
            command,
        }) => {
            override_endpoint(&mut config.downlink.host, &mut config.downlink.port, host, port);
            run_send(&config, command).await
        }
        Some(Command::Stream { mode }) => run_stream(&config, mode).await,
        None => Err("no command given; see --help".into()),
    }
}

fn override_endpoint(host: &mut String, port: &mut u16, new_host: Option<String>, new_port: Option<u16>) {
    if let Some(h) = new_host {
        *host = h;
    }
    if let Some(p) = new_port {
        *port = p;
    }
}

/// Drain a session's events until it ends.
async fn wait_disconnect(events: &mut LinkEvents) -> Option<DisconnectReason> {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Disconnected { reason } => return Some(reason),
            LinkEvent::ParseError(e) => debug!(error = %e, "skipped malformed line"),
            LinkEvent::Frame(frame) => trace!(%frame, "unhandled frame"),
        }
    }
    None
}

// ── Uplink ───────────────────────────────────────────────────────

async fn run_uplink(config: &ConsoleConfig) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = config.uplink.endpoint();
    info!(%endpoint, rate_hz = config.uplink.rate_hz, "connecting uplink");
    let (session, mut events) = LinkSession::connect(endpoint, config.uplink.link_options()).await?;

    // No controller backend is linked in; sticks stay centred.
    let mut sampler =
        ControllerSampler::spawn(NeutralDevice::new(), session.clone(), config.uplink.sampler())?;

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
        result = sampler.wait() => result.map(|_| ()),
        reason = wait_disconnect(&mut events) => {
            warn!(reason = ?reason, "uplink disconnected");
            Ok(())
        }
    };

    match sampler.stop().await {
        Ok(sent) => info!(sent, "uplink finished"),
        Err(e) => error!(error = %e, "sampler ended with an error"),
    }
    session.close().await;
    outcome?;
    Ok(())
}

// ── Downlink ─────────────────────────────────────────────────────

async fn run_downlink(config: &ConsoleConfig) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = config.downlink.endpoint();
    let router = Arc::new(TopicRouter::with_config(config.downlink.router()));
    router.subscribe_all(|msg| trace!(topic = %msg.topic, "bus message"));

    let handler: Arc<dyn FrameHandler> = router.clone();
    let (session, mut events) =
        LinkSession::with_handler(endpoint.clone(), config.downlink.link_options(), handler);
    info!(%endpoint, "connecting downlink");
    session.open().await?;

    if config.downlink.request_snapshot_on_connect {
        session
            .send(&ControlCommand::RequestFullState.into_message())
            .await?;
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            _ = ticker.tick() => log_summary(&router),
            event = events.recv() => match event {
                Some(LinkEvent::Disconnected { reason }) => {
                    warn!(%reason, "downlink disconnected");
                    break;
                }
                Some(LinkEvent::ParseError(e)) => debug!(error = %e, "skipped malformed line"),
                Some(LinkEvent::Frame(_)) => {}
                None => break,
            },
        }
    }

    session.close().await;
    log_summary(&router);
    let stats = session.stats();
    info!(
        frames = stats.frames_received,
        parse_errors = stats.parse_errors,
        rejected = router.rejected(),
        "downlink finished"
    );
    Ok(())
}

fn log_summary(router: &TopicRouter) {
    for summary in router.topics() {
        info!(
            topic = %summary.topic,
            count = summary.count,
            rate_hz = format_args!("{:.1}", summary.rate_hz),
            "topic"
        );
    }
}

// ── Send ─────────────────────────────────────────────────────────

async fn run_send(config: &ConsoleConfig, command: SendCommand) -> Result<(), Box<dyn std::error::Error>> {
    let command = match command {
        SendCommand::Snapshot => ControlCommand::RequestFullState,
        SendCommand::ZeroHeading => ControlCommand::ZeroHeading,
        SendCommand::NavWaypoints { waypoints } => ControlCommand::NavSetWaypoints(waypoints),
        SendCommand::NavStart => ControlCommand::NavStart,
        SendCommand::NavStop => ControlCommand::NavStop,
        SendCommand::NavNext => ControlCommand::NavNext,
        SendCommand::NavPrev => ControlCommand::NavPrevious,
    };

    let endpoint = config.downlink.endpoint();
    let (session, _events) = LinkSession::connect(endpoint.clone(), config.downlink.link_options()).await?;
    info!(%endpoint, %command, "sending");
    let sent = session.send(&command.into_message()).await;
    session.close().await;
    sent?;
    Ok(())
}

// ── Stream ───────────────────────────────────────────────────────

async fn run_stream(config: &ConsoleConfig, mode: StreamMode) -> Result<(), Box<dyn std::error::Error>> {
    let spec = match mode {
        StreamMode::Play { source } => {
            PipelineSpec::playback(&source.unwrap_or_else(|| config.media.source.clone()))
        }
        StreamMode::Record { source, output } => {
            let source = source.unwrap_or_else(|| config.media.source.clone());
            let path = output
                .or_else(|| config.media.record_path())
                .ok_or("no recording path; pass --output or set media.record_path")?;
            PipelineSpec::record_and_playback(&source, &path)
        }
        StreamMode::Serve { port } => {
            let mut camera = CameraSettings::default();
            if let Some(port) = port {
                camera.rtsp_port = port;
            }
            PipelineSpec::camera_rtsp(camera)
        }
    };

    let (supervisor, mut events) = MediaPipelineSupervisor::new(config.media.supervisor());
    let mut watchdog = Watchdog::from_config(&config.watchdog);
    supervisor.start(spec.clone()).await?;
    let running = supervisor.pipeline_name().unwrap_or_default();
    info!(pipeline = %running, pids = ?supervisor.stage_pids(), "pipeline running");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            event = events.recv() => match event {
                Some(PipelineEvent::UnexpectedlyStopped { name, outcome }) => {
                    match watchdog.on_unexpected_stop() {
                        Decision::Restart { after } => {
                            warn!(
                                pipeline = %name,
                                ?outcome,
                                ?after,
                                restarts = watchdog.recent_restarts(),
                                "restarting pipeline"
                            );
                            tokio::select! {
                                _ = &mut ctrl_c => {
                                    info!("interrupted");
                                    break;
                                }
                                _ = tokio::time::sleep(after) => {}
                            }
                            if let Err(e) = supervisor.start(spec.clone()).await {
                                error!(pipeline = %name, error = %e, "restart failed");
                                break;
                            }
                        }
                        Decision::GiveUp => {
                            error!(pipeline = %name, ?outcome, "pipeline keeps stopping, giving up");
                            break;
                        }
                    }
                }
                Some(event) => debug!(?event, "pipeline event"),
                None => break,
            },
        }
    }

    supervisor.stop().await?;
    Ok(())
}
