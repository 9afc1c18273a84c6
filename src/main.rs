use anyhow::{anyhow, Context};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use tokio::sync::mpsc;

use live_voice::audio::{
    list_input_devices, list_output_devices, CaptureSettings, CapturePipeline, CpalOutput,
    OutputSettings,
};
use live_voice::effects::SessionRunner;
use live_voice::settings::{default_settings_path, load_settings, AppSettings};
use live_voice::state_machine::Event;
use live_voice::streaming::{get_api_key, ChannelError, LiveConfig, LiveConnector};
use live_voice::{event_queue, SessionDriver, StatusSink, StatusView};

#[derive(Parser, Debug)]
#[command(name = "live-voice")]
#[command(version, about = "Talk to a Gemini Live model from the terminal", long_about = None)]
struct Cli {
    /// Settings file (defaults to <config dir>/live-voice/settings.json)
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Live API model
    #[arg(long)]
    model: Option<String>,

    /// Prebuilt reply voice
    #[arg(long)]
    voice: Option<String>,

    /// Plain-text system instruction file
    #[arg(long, value_name = "PATH")]
    instructions: Option<PathBuf>,

    /// WebSocket endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Input device name
    #[arg(long)]
    input_device: Option<String>,

    /// Output device name
    #[arg(long)]
    output_device: Option<String>,

    /// Microphone gain
    #[arg(long)]
    input_gain: Option<f32>,

    /// Playback gain
    #[arg(long)]
    output_gain: Option<f32>,

    /// Start recording immediately
    #[arg(long)]
    auto_record: bool,

    /// Print status updates as JSON lines
    #[arg(long)]
    json_status: bool,

    /// List audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

impl Cli {
    fn apply_overrides(&self, settings: &mut AppSettings) {
        if let Some(model) = &self.model {
            settings.model = model.clone();
        }
        if let Some(voice) = &self.voice {
            settings.voice_name = voice.clone();
        }
        if let Some(path) = &self.instructions {
            settings.instructions_path = Some(path.clone());
        }
        if let Some(endpoint) = &self.endpoint {
            settings.endpoint = endpoint.clone();
        }
        if let Some(device) = &self.input_device {
            settings.input_device = Some(device.clone());
        }
        if let Some(device) = &self.output_device {
            settings.output_device = Some(device.clone());
        }
        if let Some(gain) = self.input_gain {
            settings.input_gain = gain;
        }
        if let Some(gain) = self.output_gain {
            settings.output_gain = gain;
        }
        if self.auto_record {
            settings.auto_record = true;
        }
    }
}

/// Map one stdin line to a controller event
fn parse_command(line: &str) -> Option<Event> {
    match line.trim() {
        "" | "r" => Some(Event::ToggleRecording),
        "s" => Some(Event::StartSession),
        "q" => Some(Event::Exit),
        _ => None,
    }
}

fn status_printer(json: bool) -> StatusSink {
    Box::new(move |view: &StatusView| {
        if json {
            match serde_json::to_string(view) {
                Ok(line) => println!("{}", line),
                Err(e) => log::warn!("Failed to serialize status: {}", e),
            }
        } else {
            println!("{}", view);
        }
    })
}

/// Read commands on a plain thread so a pending read never holds up shutdown.
fn spawn_stdin_reader(events: mpsc::Sender<Event>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match parse_command(&line) {
                Some(event) => {
                    if events.blocking_send(event).is_err() {
                        break;
                    }
                }
                None => eprintln!("Commands: <enter>/r toggle mic, s restart session, q quit"),
            }
        }
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Must happen before any TLS connection is attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    if cli.list_devices {
        println!("Input devices:");
        for name in list_input_devices() {
            println!("  {}", name);
        }
        println!("Output devices:");
        for name in list_output_devices() {
            println!("  {}", name);
        }
        return Ok(());
    }

    let settings_path = cli.settings.clone().or_else(default_settings_path);
    let mut settings = match &settings_path {
        Some(path) => load_settings(path),
        None => AppSettings::default(),
    };
    cli.apply_overrides(&mut settings);

    // CLI paths are relative to the working directory, settings paths to the file
    let instructions_base = match (&cli.instructions, &settings_path) {
        (None, Some(path)) => path.parent(),
        _ => None,
    };
    let system_instruction = settings.load_instructions(instructions_base);

    let api_key = get_api_key().ok_or(ChannelError::MissingApiKey)?;

    let (tx, rx) = event_queue(settings.event_queue_capacity.max(16));

    let ended = tx.clone();
    let output = CpalOutput::open(
        &OutputSettings {
            device_name: settings.output_device.clone(),
            gain: settings.output_gain,
        },
        Box::new(move |source| {
            if !ended.notify(Event::PlaybackEnded { source }) {
                log::debug!("Session loop gone, dropping end of {}", source);
            }
        }),
    )
    .context("Failed to open audio output")?;

    let capture = CapturePipeline::new(CaptureSettings {
        device_name: settings.input_device.clone(),
        gain: settings.input_gain,
    });

    let connector = LiveConnector::new(LiveConfig {
        endpoint: settings.endpoint.clone(),
        api_key,
        model: settings.model.clone(),
        voice_name: settings.voice_name.clone(),
        system_instruction,
        outbound_queue_frames: settings.outbound_queue_frames,
    });

    let runner = SessionRunner::new(
        Box::new(connector),
        Box::new(capture),
        Box::new(output),
        tx.clone(),
    );
    let mut driver = SessionDriver::new(runner, status_printer(cli.json_status));

    tx.queue().send(Event::StartSession).await?;
    if settings.auto_record {
        // Capture starts right away; frames stream once the channel opens
        tx.queue().send(Event::StartRecording).await?;
    }

    spawn_stdin_reader(tx.queue().clone());

    let interrupt = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.notify(Event::Exit);
        }
    });

    log::info!(
        "live-voice {} ready (model {}, voice {})",
        env!("CARGO_PKG_VERSION"),
        settings.model,
        settings.voice_name
    );
    eprintln!("Commands: <enter>/r toggle mic, s restart session, q quit");

    driver.run(rx).await;
    Ok(())
}
