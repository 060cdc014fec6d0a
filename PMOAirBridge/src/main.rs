use pmoconfig::{get_config, load_env_file};
use pmoshairport::{
    Announcer, Error, FfmpegTranscoder, FileSink, LogAnnouncer, SessionSupervisor,
    ShairportConfigExt, SinkTarget,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Variables du .env avant la lecture de la configuration
    let loaded = load_env_file(".env")?;

    let config = get_config();
    logging::init_logging(&config)?;
    info!(env_vars = loaded, config_dir = config.directory(), "🚀 Starting PMOAirBridge");

    let settings = config.get_session_settings()?;
    let ffmpeg = config.get_ffmpeg_path()?;
    let target = SinkTarget::new(config.get_output_target()?);
    let wait = settings.metadata.missing_retry;

    info!(
        audio = %settings.audio_source.display(),
        metadata = %settings.metadata.path.display(),
        ffmpeg = %ffmpeg.display(),
        target = %target,
        "Session settings loaded"
    );

    let supervisor = SessionSupervisor::spawn(
        settings,
        Arc::new(FileSink::new()),
        Arc::new(FfmpegTranscoder::new(ffmpeg)),
    );
    let announcer: Arc<dyn Announcer> = Arc::new(LogAnnouncer);

    tokio::select! {
        started = start_when_ready(&supervisor, &target, &announcer, wait) => started?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before the session started");
            supervisor.shutdown().await?;
            return Ok(());
        }
    }

    let status = supervisor.status().await?;
    info!(
        session = ?status.session_id,
        state = %status.state,
        pipeline = %status.pipeline,
        metadata_present = status.metadata_source_present,
        "✅ Relay running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutting down");

    let status = supervisor.status().await?;
    info!(
        now_playing = %status.track,
        frames = status.reader.frames,
        parse_errors = status.reader.parse_errors,
        restart_attempts = status.restart_attempts,
        "Final session status"
    );
    supervisor.shutdown().await?;
    Ok(())
}

/// Starts the session, waiting for shairport to create its audio pipe
async fn start_when_ready(
    supervisor: &SessionSupervisor,
    target: &SinkTarget,
    announcer: &Arc<dyn Announcer>,
    wait: Duration,
) -> anyhow::Result<()> {
    loop {
        match supervisor.start_session(target.clone(), announcer).await {
            Ok(()) => return Ok(()),
            Err(Error::SourceUnavailable { kind, path }) => {
                warn!(%kind, path = %path.display(), "Waiting for shairport-sync");
                tokio::time::sleep(wait).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}
