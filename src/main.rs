use anyhow::Result;
use chrono::Local;
use clap::Parser;
use ride_recorder::config::{AppSessionConfig, AuthState};
use ride_recorder::media::{MediaAttachment, MediaKind};
use ride_recorder::persistence::CsvFileSink;
use ride_recorder::recorder::{self, Command, Recorder, SessionEvent};
use ride_recorder::sensors::{self, SensorEvent};
use ride_recorder::upload::{HttpRemoteService, NominatimGeocoder, UploadCoordinator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

#[derive(Parser, Debug)]
#[command(name = "ride_recorder")]
#[command(about = "Record ride acceleration, heading and location at 200 ms and upload the session", long_about = None)]
struct Args {
    /// Recording duration in seconds (0 = until Ctrl-C or the 10 minute cap)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Ride name
    #[arg(long)]
    ride: Option<String>,

    /// Number of seats / riders
    #[arg(long)]
    seats: Option<u32>,

    /// Experiment id the session is attached to on upload
    #[arg(long)]
    target_id: Option<String>,

    /// Human-readable session name
    #[arg(long)]
    session_name: Option<String>,

    /// Ride list comes from the venue preset
    #[arg(long)]
    venue_preset: bool,

    /// JSON file with saved setup values (command line wins)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective setup back to --config
    #[arg(long)]
    save_config: bool,

    /// Output directory
    #[arg(long, default_value = "ride_sessions")]
    output_dir: PathBuf,

    /// Base URL of the data-sharing service; without it nothing is uploaded
    #[arg(long)]
    upload_url: Option<String>,

    /// Logged-in user for uploads
    #[arg(long)]
    user: Option<String>,

    /// Photos/videos captured during setup
    #[arg(long, num_args = 1..)]
    media: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cli = AppSessionConfig {
        ride_name: args.ride.clone(),
        seat_count: args.seats,
        target_id: args.target_id.clone(),
        session_name: args.session_name.clone(),
        venue_preset: args.venue_preset,
    };
    let config = match &args.config {
        Some(path) if path.exists() => cli.merged_over(AppSessionConfig::load(path)?),
        _ => cli,
    };
    if let (true, Some(path)) = (args.save_config, &args.config) {
        config.save(path)?;
    }

    println!("[{}] Ride Recorder Starting", ts_now());
    println!("  Ride: {}", config.ride_label());
    println!("  Seats: {}", config.seat_count.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()));
    println!("  Duration: {} seconds (0=until stopped)", args.duration);
    println!("  Output Dir: {}", args.output_dir.display());
    println!(
        "  Upload: {}",
        args.upload_url.as_deref().unwrap_or("disabled")
    );

    std::fs::create_dir_all(&args.output_dir)?;

    let sink = CsvFileSink::new(&args.output_dir);
    let media_folder = sink.folder().to_path_buf();
    let auth = args
        .user
        .as_deref()
        .map(AuthState::logged_in_as)
        .unwrap_or_default();
    let upload_enabled = args.upload_url.is_some();

    let coordinator = Arc::new(UploadCoordinator::new(
        HttpRemoteService::new(args.upload_url.as_deref().unwrap_or_default())?,
        NominatimGeocoder::new()?,
    ));

    let (sensor_tx, sensor_rx) = mpsc::channel::<SensorEvent>(500);
    let (command_tx, command_rx) = mpsc::channel::<Command>(32);
    let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(64);

    let _accel_handle = tokio::spawn(sensors::accel_loop(sensor_tx.clone()));
    let _mag_handle = tokio::spawn(sensors::mag_loop(sensor_tx.clone()));
    let _location_handle = tokio::spawn(sensors::location_loop(sensor_tx.clone()));
    drop(sensor_tx);

    let recorder = Recorder::new(sink, media_folder, AppSessionConfig::default(), auth);
    let loop_handle = tokio::spawn(recorder::run(recorder, coordinator, sensor_rx, command_rx, event_tx));

    for command in startup_commands(config, &args.media) {
        command_tx.send(command).await?;
    }

    let stop_timer = sleep(Duration::from_secs(args.duration));
    tokio::pin!(stop_timer);
    let mut recording = false;
    let mut stop_sent = false;

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::SetupConfirmed { media_flushed } if media_flushed > 0 => {
                        println!("[{}] {} media file(s) queued for upload", ts_now(), media_flushed);
                    }
                    SessionEvent::SetupRequired => {
                        eprintln!("[{}] Ride name and seat count are required (--ride, --seats)", ts_now());
                        send(&command_tx, Command::Shutdown).await;
                    }
                    SessionEvent::Started => {
                        recording = true;
                        println!("[{}] Recording...", ts_now());
                    }
                    SessionEvent::StorageWriteFailed(message) => {
                        eprintln!("[{}] Could not write data file ({}); keeping data in memory", ts_now(), message);
                    }
                    SessionEvent::Stopped(summary) => {
                        recording = false;
                        println!("[{}] Recording stopped after {} rows", ts_now(), summary.row_count);
                    }
                    SessionEvent::AutoStopped(summary) => {
                        recording = false;
                        println!("[{}] Time up: recording stopped at {}", ts_now(), summary.elapsed_display());
                    }
                    SessionEvent::ChoiceRequested { .. } => {
                        send(&command_tx, Command::ChooseUpload(upload_enabled)).await;
                    }
                    SessionEvent::UploadStarted { rows, media } => {
                        println!("[{}] Uploading {} rows and {} media file(s)...", ts_now(), rows, media);
                    }
                    SessionEvent::UploadFinished(receipt) => {
                        println!("[{}] Upload complete: session {}", ts_now(), receipt.session_id);
                    }
                    SessionEvent::UploadFailed { message, media_uploaded } => {
                        eprintln!("[{}] {} ({} media file(s) sent)", ts_now(), message, media_uploaded);
                    }
                    SessionEvent::UploadPrereqMissing(reason) => {
                        eprintln!("[{}] Cannot upload: {}", ts_now(), reason);
                    }
                    SessionEvent::NoDataToUpload => {
                        println!("[{}] No data to upload", ts_now());
                    }
                    SessionEvent::Summary(summary) => {
                        println!("\n=== Session Summary ===\n{}\n", summary);
                        send(&command_tx, Command::Shutdown).await;
                    }
                    SessionEvent::ShutDown => break,
                    other => log::debug!("event: {:?}", other),
                }
            }

            _ = &mut stop_timer, if args.duration > 0 && !stop_sent => {
                println!("[{}] Duration reached, stopping...", ts_now());
                stop_sent = true;
                send(&command_tx, Command::Stop).await;
            }

            _ = tokio::signal::ctrl_c() => {
                if recording && !stop_sent {
                    println!("[{}] Interrupted, stopping...", ts_now());
                    stop_sent = true;
                    send(&command_tx, Command::Stop).await;
                } else {
                    send(&command_tx, Command::Shutdown).await;
                }
            }
        }
    }

    let recorder = loop_handle.await?;
    let session = recorder.session();
    println!("\n=== Final Stats ===");
    println!("Rows in memory: {}", session.rows().len());
    if let Some(path) = session.sink().last_path() {
        println!("Data file: {}", path.display());
    }
    println!("Media awaiting upload: {}", recorder.media().media_count());

    Ok(())
}

/// Captures, then setup, then start. An incomplete setup gets no `Start`, so
/// `SetupRequired` is reported once.
fn startup_commands(config: AppSessionConfig, media: &[PathBuf]) -> Vec<Command> {
    let complete = config.ride_setup().is_ok();
    let mut commands: Vec<Command> = media
        .iter()
        .map(|path| Command::CaptureMedia(MediaAttachment::new(path, media_kind(path))))
        .collect();
    commands.push(Command::Setup(config));
    if complete {
        commands.push(Command::Start);
    }
    commands
}

/// The loop may already be gone after a shutdown; later commands are dropped
async fn send(tx: &mpsc::Sender<Command>, command: Command) {
    if tx.send(command).await.is_err() {
        log::debug!("recorder loop already stopped");
    }
}

fn media_kind(path: &Path) -> MediaKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ["3gp", "mp4", "mkv", "webm"].contains(&ext.to_ascii_lowercase().as_str()) => {
            MediaKind::Video
        }
        _ => MediaKind::Photo,
    }
}

fn ts_now() -> String {
    Local::now().format("%H:%M:%S").to_string()
}
