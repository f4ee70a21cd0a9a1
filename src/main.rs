use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use twilio_voice::edge::EdgeConfig;
use twilio_voice::types::events::CallEvent;
use twilio_voice::{CallSession, CustomParameters, Device, DeviceOptions};

// Registers a device and logs everything that happens to it.
//
// Usage:
//   cargo run -- --token $TOKEN                          # register and wait
//   cargo run -- --token $TOKEN --accept                 # answer every incoming call
//   cargo run -- --token $TOKEN --edge sydney --edge roaming
//   cargo run -- --token $TOKEN --call --param To=client:bob

#[derive(Parser, Debug)]
#[command(name = "twilio-voice", about = "Register a voice device and log its calls")]
struct Args {
    /// Access token.
    #[arg(long, env = "TWILIO_TOKEN", hide_env_values = true)]
    token: String,

    /// Edge to connect through; repeat for an ordered fallback list.
    #[arg(long = "edge")]
    edges: Vec<String>,

    /// Legacy region code.
    #[arg(long)]
    region: Option<String>,

    /// JSON file with device options.
    #[arg(long)]
    options: Option<PathBuf>,

    /// Accept incoming calls.
    #[arg(long)]
    accept: bool,

    /// Place an outbound call instead of registering.
    #[arg(long)]
    call: bool,

    /// Custom parameter for the outbound call, as `key=value`.
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(args)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut options = match &args.options {
        Some(path) => DeviceOptions::from_json_file(path)?,
        None => DeviceOptions::default(),
    };
    if !args.edges.is_empty() {
        options.edge = Some(EdgeConfig::Ordered(args.edges.clone()));
    }
    if args.region.is_some() {
        options.region = args.region.clone();
    }

    let device = Device::builder()
        .with_token(args.token)
        .with_options(options)
        .build()?;
    spawn_device_logger(&device, args.accept);

    if args.call {
        let params: CustomParameters = args.params.into_iter().collect();
        let call = device.connect(params).await?;
        info!("Calling with sid {}", call.call_sid());
        tokio::spawn(log_call_events(call));
    } else {
        device.register().await?;
        info!("Registered, waiting for calls. Press Ctrl-C to exit.");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    device.destroy().await;
    Ok(())
}

fn spawn_device_logger(device: &Device, accept: bool) {
    let mut incoming = device.events().incoming.subscribe();
    tokio::spawn(async move {
        loop {
            match incoming.recv().await {
                Ok(event) => {
                    let call = event.call.clone();
                    info!(
                        "Incoming call {} from {}",
                        call.call_sid(),
                        call.parameters().from.as_deref().unwrap_or("unknown")
                    );
                    tokio::spawn(log_call_events(call.clone()));
                    if accept {
                        if let Err(e) = call.accept() {
                            warn!("Could not accept {}: {e}", call.call_sid());
                        }
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Missed {n} incoming call events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut errors = device.events().error.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = errors.recv().await {
            error!("Device error: {}", event.error);
        }
    });

    let mut transport = device.events().transport_state.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = transport.recv().await {
            info!("Signaling: {:?}", event.state);
        }
    });
}

async fn log_call_events(call: CallSession) {
    let sid = call.call_sid().to_string();
    let mut events = call.subscribe();
    loop {
        match events.recv().await {
            Ok(CallEvent::Sample(sample)) => {
                log::debug!("[{sid}] mos={:?} jitter={:?} rtt={:?}", sample.mos, sample.jitter, sample.rtt);
            }
            Ok(CallEvent::Warning(w)) => warn!("[{sid}] Quality warning: {}", w.name),
            Ok(CallEvent::WarningCleared(w)) => info!("[{sid}] Quality warning cleared: {}", w.name),
            Ok(CallEvent::Error(e)) => error!("[{sid}] {e}"),
            Ok(CallEvent::Closed(summary)) => {
                info!(
                    "[{sid}] Closed ({:?}) after {:?}s with {} samples",
                    summary.reason,
                    summary.duration_secs,
                    summary.samples.len()
                );
                break;
            }
            Ok(event) => info!("[{sid}] {event:?}"),
            Err(RecvError::Lagged(n)) => warn!("[{sid}] Missed {n} call events"),
            Err(RecvError::Closed) => break,
        }
    }
}
