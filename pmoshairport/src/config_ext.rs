//! Extension pour intégrer le relais shairport dans pmoconfig
//!
//! Ce module fournit le trait `ShairportConfigExt` qui ajoute à
//! `pmoconfig::Config` la lecture des réglages du relais : chemins des pipes
//! shairport, binaire ffmpeg, politique de redémarrage, santé, lecteur de
//! métadonnées et cible de sortie.
//!
//! # Exemple
//!
//! ```no_run
//! use pmoconfig::get_config;
//! use pmoshairport::ShairportConfigExt;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = get_config();
//! let settings = config.get_session_settings()?;
//! println!("Reading PCM from {}", settings.audio_source.display());
//! # Ok(())
//! # }
//! ```
//!
//! Les pipes acceptent aussi les variables historiques
//! `SHAIRPORT_PIPE_PATH` et `SHAIRPORT_METADATA_PIPE_PATH`, prioritaires
//! sur le fichier.

use crate::health::HealthSettings;
use crate::pipeline::RetryPolicy;
use crate::reader::ReaderSettings;
use crate::supervisor::{SessionSettings, DEFAULT_AUDIO_PIPE, DEFAULT_METADATA_PIPE};
use anyhow::Result;
use pmoconfig::Config;
use serde_yaml::Value;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_AUDIO_PIPE: &str = "SHAIRPORT_PIPE_PATH";
pub const ENV_METADATA_PIPE: &str = "SHAIRPORT_METADATA_PIPE_PATH";

pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";
pub const DEFAULT_OUTPUT_TARGET: &str = "/tmp/pmoairbridge.opus";

/// Trait d'extension pour la configuration du relais shairport
///
/// # Auto-persist des valeurs par défaut
///
/// Les getters persistent automatiquement les valeurs par défaut dans la
/// configuration si elles n'existent pas encore.
pub trait ShairportConfigExt {
    /// Chemin du pipe PCM écrit par shairport-sync
    fn get_shairport_audio_pipe(&self) -> Result<PathBuf>;

    fn set_shairport_audio_pipe(&self, path: &str) -> Result<()>;

    /// Chemin du pipe de métadonnées
    fn get_shairport_metadata_pipe(&self) -> Result<PathBuf>;

    fn set_shairport_metadata_pipe(&self, path: &str) -> Result<()>;

    fn get_ffmpeg_path(&self) -> Result<PathBuf>;

    /// Politique de redémarrage automatique
    ///
    /// `max_attempts: 0` signifie sans limite.
    fn get_retry_policy(&self) -> Result<RetryPolicy>;

    fn get_health_settings(&self) -> Result<HealthSettings>;

    fn get_reader_settings(&self) -> Result<ReaderSettings>;

    /// Tous les réglages d'une session
    fn get_session_settings(&self) -> Result<SessionSettings>;

    /// Cible passée au sink (fichier ou FIFO pour le `FileSink`)
    fn get_output_target(&self) -> Result<String>;

    fn set_output_target(&self, target: &str) -> Result<()>;
}

fn env_override(name: &str) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| PathBuf::from(v.trim()))
}

impl ShairportConfigExt for Config {
    fn get_shairport_audio_pipe(&self) -> Result<PathBuf> {
        if let Some(path) = env_override(ENV_AUDIO_PIPE) {
            return Ok(path);
        }
        self.get_or_init_string(&["shairport", "audio_pipe"], DEFAULT_AUDIO_PIPE)
            .map(PathBuf::from)
    }

    fn set_shairport_audio_pipe(&self, path: &str) -> Result<()> {
        self.set_value(&["shairport", "audio_pipe"], Value::String(path.to_string()))
    }

    fn get_shairport_metadata_pipe(&self) -> Result<PathBuf> {
        if let Some(path) = env_override(ENV_METADATA_PIPE) {
            return Ok(path);
        }
        self.get_or_init_string(&["shairport", "metadata_pipe"], DEFAULT_METADATA_PIPE)
            .map(PathBuf::from)
    }

    fn set_shairport_metadata_pipe(&self, path: &str) -> Result<()> {
        self.set_value(
            &["shairport", "metadata_pipe"],
            Value::String(path.to_string()),
        )
    }

    fn get_ffmpeg_path(&self) -> Result<PathBuf> {
        self.get_or_init_string(&["transcoder", "ffmpeg_path"], DEFAULT_FFMPEG_PATH)
            .map(PathBuf::from)
    }

    fn get_retry_policy(&self) -> Result<RetryPolicy> {
        let defaults = RetryPolicy::default();
        let cooldown =
            self.get_or_init_u64(&["pipeline", "retry", "cooldown_secs"], defaults.cooldown.as_secs())?;
        let multiplier =
            self.get_or_init_f64(&["pipeline", "retry", "multiplier"], defaults.multiplier)?;
        let max_delay = self.get_or_init_u64(
            &["pipeline", "retry", "max_delay_secs"],
            defaults.max_delay.as_secs(),
        )?;
        let max_attempts = self.get_or_init_u64(
            &["pipeline", "retry", "max_attempts"],
            defaults.max_attempts.map(u64::from).unwrap_or(0),
        )?;
        let reset_after = self.get_or_init_u64(
            &["pipeline", "retry", "reset_after_secs"],
            defaults.reset_after.as_secs(),
        )?;

        Ok(RetryPolicy {
            cooldown: Duration::from_secs(cooldown),
            multiplier,
            max_delay: Duration::from_secs(max_delay),
            max_attempts: match max_attempts {
                0 => None,
                n => Some(u32::try_from(n).unwrap_or(u32::MAX)),
            },
            reset_after: Duration::from_secs(reset_after),
        })
    }

    fn get_health_settings(&self) -> Result<HealthSettings> {
        let defaults = HealthSettings::default();
        let heartbeat = self.get_or_init_u64(
            &["health", "heartbeat_secs"],
            defaults.heartbeat_period.as_secs(),
        )?;
        let keepalive = self.get_or_init_u64(
            &["health", "keepalive_secs"],
            defaults.keepalive_period.as_secs(),
        )?;
        Ok(HealthSettings {
            heartbeat_period: Duration::from_secs(heartbeat),
            keepalive_period: Duration::from_secs(keepalive),
        })
    }

    fn get_reader_settings(&self) -> Result<ReaderSettings> {
        let mut settings = ReaderSettings::new(self.get_shairport_metadata_pipe()?);
        settings.idle_poll = Duration::from_millis(self.get_or_init_u64(
            &["metadata", "idle_poll_ms"],
            settings.idle_poll.as_millis() as u64,
        )?);
        settings.missing_retry = Duration::from_secs(self.get_or_init_u64(
            &["metadata", "missing_retry_secs"],
            settings.missing_retry.as_secs(),
        )?);
        settings.join_timeout = Duration::from_millis(self.get_or_init_u64(
            &["metadata", "join_timeout_ms"],
            settings.join_timeout.as_millis() as u64,
        )?);
        Ok(settings)
    }

    fn get_session_settings(&self) -> Result<SessionSettings> {
        let defaults = SessionSettings::default();
        Ok(SessionSettings {
            audio_source: self.get_shairport_audio_pipe()?,
            metadata: self.get_reader_settings()?,
            health: self.get_health_settings()?,
            retry: self.get_retry_policy()?,
            restart_settle: Duration::from_millis(self.get_or_init_u64(
                &["pipeline", "restart_settle_ms"],
                defaults.restart_settle.as_millis() as u64,
            )?),
            reconnect_delay: Duration::from_millis(self.get_or_init_u64(
                &["session", "reconnect_delay_ms"],
                defaults.reconnect_delay.as_millis() as u64,
            )?),
        })
    }

    fn get_output_target(&self) -> Result<String> {
        self.get_or_init_string(&["output", "target"], DEFAULT_OUTPUT_TARGET)
    }

    fn set_output_target(&self, target: &str) -> Result<()> {
        self.set_value(&["output", "target"], Value::String(target.to_string()))
    }
}
