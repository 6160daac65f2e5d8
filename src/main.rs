use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use avatar_gateway::config::ClientConfig;
use avatar_gateway::voice::{AudioCapture, AudioFrame, AudioPlayback, CaptureEncoder, SessionGate};
use avatar_gateway::{ApiServer, Config, Conversation};

/// Avatar - realtime voice relay and talking-head client
#[derive(Parser)]
#[command(name = "avatar", version, about)]
struct Cli {
    /// Port to listen on (overrides `AVATAR_PORT` and the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Run the relay server (default)
    Serve,
    /// Talk to the service through a running relay
    Talk {
        /// Relay URL to connect to
        #[arg(long, env = "AVATAR_RELAY_URL")]
        relay_url: Option<String>,
        /// Print avatar frames as JSON lines on stdout
        #[arg(long)]
        emit_frames: bool,
    },
    /// Test microphone input and the capture encoder
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output through the playback scheduler
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "info,avatar_gateway=info",
        1 => "info,avatar_gateway=debug",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    avatar_gateway::relay::ensure_crypto_provider();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.relay.port = port;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Talk {
            relay_url,
            emit_frames,
        } => {
            let mut client = config.client;
            if let Some(url) = relay_url {
                client.relay_url = url;
            }
            talk(&client, emit_frames).await
        }
        Command::TestMic { duration } => test_mic(&config.client, duration).await,
        Command::TestSpeaker => test_speaker(&config.client).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    anyhow::ensure!(
        config.relay.api_key.is_some(),
        "GEMINI_API_KEY is not set; the relay cannot reach the speech service"
    );

    tracing::info!(
        port = config.relay.port,
        path = %config.relay.path,
        "starting avatar relay"
    );

    let server = ApiServer::new(config.relay);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}

/// Run one conversation until it ends or the user interrupts
#[allow(clippy::future_not_send)]
async fn talk(client: &ClientConfig, emit_frames: bool) -> anyhow::Result<()> {
    let mut conversation = Conversation::start(client).await?;

    let mut status = conversation.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().to_string();
            tracing::info!(status = %current, "session status");
        }
    });

    if emit_frames {
        let mut frames = conversation.frames();
        tokio::spawn(async move {
            while frames.changed().await.is_ok() {
                let frame = *frames.borrow_and_update();
                match serde_json::to_string(&frame) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "failed to encode frame"),
                }
            }
        });
    }

    println!("Talking to {} - press Ctrl+C to stop", client.relay_url);

    let ended = tokio::select! {
        result = conversation.wait() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    match ended {
        Some(result) => result?,
        None => {
            println!();
            conversation.shutdown();
        }
    }
    Ok(())
}

/// Show the encoder's volume and the frames it would send
#[allow(clippy::future_not_send)]
async fn test_mic(client: &ClientConfig, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new()?;
    let sample_rate = capture.sample_rate();
    println!("Device rate: {sample_rate} Hz -> {} Hz", client.capture.target_rate);
    println!("---");

    let gate = SessionGate::new();
    gate.open();
    let (frame_tx, mut frame_rx) = mpsc::channel::<AudioFrame>(256);
    let (fault_tx, mut faults) = mpsc::unbounded_channel();
    let encoder = CaptureEncoder::new(client.capture.clone(), sample_rate, gate.clone(), frame_tx);
    let volume = encoder.volume_meter();
    capture.start(encoder, fault_tx)?;

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Ok(fault) = faults.try_recv() {
            capture.stop();
            return Err(fault.into());
        }

        let mut frames = 0usize;
        let mut samples = 0usize;
        while let Ok(frame) = frame_rx.try_recv() {
            frames += 1;
            samples += frame.samples.len();
        }

        let level = volume.get();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (level * 50.0).round() as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len.min(50));

        println!(
            "[{:2}s] volume: {level:.3} | frames: {frames:3} | samples: {samples:6} | [{meter}]",
            i + 1,
        );
    }

    gate.close();
    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If the volume stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Play a tone through the scheduler in reply-sized chunks
#[allow(clippy::future_not_send)]
async fn test_speaker(client: &ClientConfig) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let mut playback = AudioPlayback::new(&client.playback)?;
    let (fault_tx, mut faults) = mpsc::unbounded_channel();
    playback.start(fault_tx)?;

    let sample_rate = 24_000_u32;
    let frequency = 440.0_f32;
    let chunk = 2_400;
    let total = sample_rate as usize * 2;

    #[allow(clippy::cast_precision_loss)]
    let tone: Vec<f32> = (0..total)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    println!("Scheduling {} samples at {sample_rate} Hz in {chunk}-sample chunks...", tone.len());

    let queue = playback.queue();
    for piece in tone.chunks(chunk) {
        queue.enqueue(AudioFrame::new(piece.to_vec(), sample_rate))?;
    }

    while !queue.is_idle() {
        if let Ok(fault) = faults.try_recv() {
            playback.stop();
            return Err(fault.into());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    playback.stop();

    println!("\n---");
    println!("If you heard one continuous tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
