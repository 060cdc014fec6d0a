//! Periodic session health checks
//!
//! Two background tasks share a cancellation token:
//!
//! - the heartbeat records connection and playback state in a
//!   [`HealthSnapshot`] and logs it;
//! - the keepalive watches the sink and asks the supervisor to act when
//!   the connection is gone or playback has silently stopped.

use crate::error::Result;
use crate::sink::SinkHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Shortest period accepted; tokio intervals panic on zero
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connected: bool,
    pub playing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSettings {
    pub heartbeat_period: Duration,
    pub keepalive_period: Duration,
}

impl HealthSettings {
    /// Same settings with both periods raised to at least [`MIN_PERIOD`]
    pub fn clamped(&self) -> Self {
        Self {
            heartbeat_period: self.heartbeat_period.max(MIN_PERIOD),
            keepalive_period: self.keepalive_period.max(MIN_PERIOD),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            keepalive_period: DEFAULT_KEEPALIVE_PERIOD,
        }
    }
}

/// What the keepalive asks of the supervisor
#[derive(Debug)]
pub enum KeepaliveSignal {
    /// The sink is no longer connected; the keepalive has stopped
    ConnectionLost,
    /// Connected but silent; the supervisor answers with the restart outcome
    RestartRequested { reply: oneshot::Sender<Result<()>> },
}

pub struct HealthMonitor {
    cancel: CancellationToken,
    heartbeat: JoinHandle<()>,
    keepalive: JoinHandle<()>,
}

impl HealthMonitor {
    /// Starts both tasks; their first check happens one period from now
    pub fn spawn(
        settings: HealthSettings,
        handle: Arc<dyn SinkHandle>,
        snapshot: Arc<watch::Sender<HealthSnapshot>>,
        signals: mpsc::UnboundedSender<KeepaliveSignal>,
    ) -> Self {
        let settings = settings.clamped();
        let cancel = CancellationToken::new();

        let heartbeat = tokio::spawn(heartbeat_loop(
            settings.heartbeat_period,
            handle.clone(),
            snapshot,
            cancel.clone(),
        ));
        let keepalive = tokio::spawn(keepalive_loop(
            settings.keepalive_period,
            handle,
            signals,
            cancel.clone(),
        ));

        Self {
            cancel,
            heartbeat,
            keepalive,
        }
    }

    pub fn keepalive_running(&self) -> bool {
        !self.keepalive.is_finished()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.heartbeat.await;
        let _ = self.keepalive.await;
        debug!("Health monitor stopped");
    }
}

async fn heartbeat_loop(
    period: Duration,
    handle: Arc<dyn SinkHandle>,
    snapshot: Arc<watch::Sender<HealthSnapshot>>,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let connected = handle.is_connected();
                let playing = handle.is_playing();
                snapshot.send_modify(|s| {
                    s.last_heartbeat = Some(Utc::now());
                    s.connected = connected;
                    s.playing = playing;
                });
                info!(connected, playing, "💓 Heartbeat");
            }
        }
    }
}

async fn keepalive_loop(
    period: Duration,
    handle: Arc<dyn SinkHandle>,
    signals: mpsc::UnboundedSender<KeepaliveSignal>,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !handle.is_connected() {
                    warn!("Keepalive: sink connection lost");
                    let _ = signals.send(KeepaliveSignal::ConnectionLost);
                    break;
                }
                if handle.is_playing() {
                    debug!("Keepalive: playing");
                    continue;
                }

                warn!("Keepalive: connected but not playing, requesting restart");
                let (reply, answer) = oneshot::channel();
                if signals.send(KeepaliveSignal::RestartRequested { reply }).is_err() {
                    break;
                }
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = answer => outcome,
                };
                match outcome {
                    Ok(Ok(())) => info!("Keepalive: playback restarted"),
                    Ok(Err(err)) => {
                        warn!(error = %err, "Keepalive: restart failed, giving up");
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::pipeline::EncodedStream;
    use crate::sink::PlaybackCompletion;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct StubHandle {
        connected: AtomicBool,
        playing: AtomicBool,
    }

    impl StubHandle {
        fn new(connected: bool, playing: bool) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(connected),
                playing: AtomicBool::new(playing),
            })
        }
    }

    #[async_trait]
    impl SinkHandle for StubHandle {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }

        async fn play(&self, _stream: EncodedStream) -> Result<PlaybackCompletion> {
            Ok(PlaybackCompletion::ready(Ok(())))
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn snapshot() -> Arc<watch::Sender<HealthSnapshot>> {
        Arc::new(watch::Sender::new(HealthSnapshot::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_updates_snapshot() {
        let handle = StubHandle::new(true, true);
        let snapshot = snapshot();
        let mut rx = snapshot.subscribe();
        let (tx, _signals) = mpsc::unbounded_channel();

        let started = Instant::now();
        let monitor = HealthMonitor::spawn(HealthSettings::default(), handle, snapshot, tx);

        rx.changed().await.unwrap();
        assert!(started.elapsed() >= DEFAULT_HEARTBEAT_PERIOD);
        let seen = rx.borrow().clone();
        assert!(seen.last_heartbeat.is_some());
        assert!(seen.connected);
        assert!(seen.playing);

        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_requests_restart_when_silent() {
        let handle = StubHandle::new(true, false);
        let (tx, mut signals) = mpsc::unbounded_channel();
        let started = Instant::now();
        let monitor = HealthMonitor::spawn(HealthSettings::default(), handle.clone(), snapshot(), tx);

        match signals.recv().await.unwrap() {
            KeepaliveSignal::RestartRequested { reply } => {
                assert!(started.elapsed() >= DEFAULT_KEEPALIVE_PERIOD);
                handle.playing.store(true, Ordering::SeqCst);
                reply.send(Ok(())).unwrap();
            }
            other => panic!("unexpected signal {other:?}"),
        }

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(signals.try_recv().is_err());
        assert!(monitor.keepalive_running());
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_gives_up_after_failed_restart() {
        let handle = StubHandle::new(true, false);
        let (tx, mut signals) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::spawn(HealthSettings::default(), handle, snapshot(), tx);

        match signals.recv().await.unwrap() {
            KeepaliveSignal::RestartRequested { reply } => {
                reply.send(Err(Error::pipeline("no audio"))).unwrap();
            }
            other => panic!("unexpected signal {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!monitor.keepalive_running());
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_reports_connection_loss() {
        let handle = StubHandle::new(false, false);
        let (tx, mut signals) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::spawn(HealthSettings::default(), handle, snapshot(), tx);

        assert!(matches!(
            signals.recv().await.unwrap(),
            KeepaliveSignal::ConnectionLost
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!monitor.keepalive_running());
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_periods_are_raised_to_minimum() {
        let handle = StubHandle::new(false, false);
        let snapshot = snapshot();
        let mut rx = snapshot.subscribe();
        let (tx, mut signals) = mpsc::unbounded_channel();
        let settings = HealthSettings {
            heartbeat_period: Duration::ZERO,
            keepalive_period: Duration::ZERO,
        };

        let started = Instant::now();
        let monitor = HealthMonitor::spawn(settings, handle, snapshot, tx);

        assert!(matches!(
            signals.recv().await.unwrap(),
            KeepaliveSignal::ConnectionLost
        ));
        assert!(started.elapsed() >= MIN_PERIOD);
        rx.changed().await.unwrap();
        assert!(rx.borrow().last_heartbeat.is_some());
        monitor.shutdown().await;
    }
}
