//! Main application orchestrator.
//!
//! Owns the event channel and decides what happens when it gives up:
//! exit with an error, or wait and connect again from attempt 1.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::router::{log_summary, EventRouter, StreamStats, StreamSummary};
use siem_telemetry::Metrics;
use siem_ws::{ChannelNotification, ChannelOptions, ChannelState, ResilientChannel};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep, Sleep};
use tracing::{debug, error, info, warn};

/// Extra time allowed beyond the close timeout when shutting down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Main application.
pub struct Application {
    config: AppConfig,
    channel: ResilientChannel,
    router: EventRouter,
    stats: StreamStats,
}

impl Application {
    /// Create a new application with the given configuration.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;

        let options = ChannelOptions::from(&config.channel);
        let channel = ResilientChannel::new(config.ws_url.clone(), options);
        let stats = StreamStats::default();
        let router = EventRouter::new(config.stream.min_severity, stats.clone());

        Ok(Self {
            config,
            channel,
            router,
            stats,
        })
    }

    pub fn channel(&self) -> &ResilientChannel {
        &self.channel
    }

    /// Handle on the running totals, usable while `run` is in progress.
    pub fn stats(&self) -> StreamStats {
        self.stats.clone()
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> AppResult<StreamSummary> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(?e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `shutdown` completes or the channel gives up for good.
    ///
    /// # Errors
    ///
    /// - `AppError::ChannelExhausted`: retries exhausted and the restart
    ///   policy does not allow another attempt
    /// - `AppError::Channel`: the channel could not be started
    pub async fn run_until<F>(self, shutdown: F) -> AppResult<StreamSummary>
    where
        F: Future<Output = ()>,
    {
        let mut notifications = self.channel.subscribe();
        Metrics::channel_state_set(self.channel.state().as_str());

        info!(endpoint = %self.config.ws_url, "Starting stream consumer");
        self.channel.connect(self.router.clone())?;

        let mut restarts = 0u32;
        let mut restart_pending = false;
        let mut restart_timer: Pin<Box<Sleep>> = Box::pin(sleep(Duration::ZERO));

        let summary_period = self.config.summary_interval();
        let mut summary_interval =
            tokio::time::interval(summary_period.unwrap_or(Duration::from_secs(3600)));
        // The first tick completes immediately.
        summary_interval.tick().await;

        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break Ok(());
                }

                notification = notifications.recv() => match notification {
                    Ok(ChannelNotification::RetriesExhausted { attempts }) => {
                        Metrics::retries_exhausted();
                        if self.config.restart.allows(restarts) {
                            let delay = self.config.restart.delay();
                            warn!(
                                attempts,
                                restart = restarts + 1,
                                delay_ms = delay.as_millis() as u64,
                                "Event channel gave up, restarting after delay"
                            );
                            restart_timer = Box::pin(sleep(delay));
                            restart_pending = true;
                        } else {
                            error!(attempts, restarts, "Event channel gave up, exiting");
                            break Err(AppError::ChannelExhausted { attempts, restarts });
                        }
                    }
                    Ok(notification) => self.observe(notification),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Channel notifications lagged");
                    }
                    Err(RecvError::Closed) => break Ok(()),
                },

                _ = &mut restart_timer, if restart_pending => {
                    restart_pending = false;
                    restarts += 1;
                    Metrics::app_restarted();
                    self.stats.update(|s| s.restarts = restarts);
                    info!(restart = restarts, "Restarting event channel");
                    if let Err(e) = self.channel.connect(self.router.clone()) {
                        break Err(e.into());
                    }
                }

                _ = summary_interval.tick(), if summary_period.is_some() => {
                    log_summary(&self.stats.snapshot(), "Stream summary");
                }
            }
        };

        self.shutdown(&mut notifications).await;
        let summary = self.stats.snapshot();
        log_summary(&summary, "Final stream summary");
        match Metrics::gather_text() {
            Ok(text) => debug!(metrics = %text, "Final metrics"),
            Err(e) => warn!(error = %e, "Failed to render final metrics"),
        }

        outcome.map(|()| summary)
    }

    /// Mirror a channel notification into metrics and totals.
    fn observe(&self, notification: ChannelNotification) {
        match notification {
            ChannelNotification::StateChanged { to, .. } => {
                Metrics::channel_state_set(to.as_str());
            }
            ChannelNotification::ReconnectScheduled { delay, .. } => {
                Metrics::reconnect_scheduled(delay.as_millis() as f64);
                self.stats.update(|s| s.reconnects += 1);
            }
            ChannelNotification::DecodeFailed { .. } => {
                Metrics::frame_decode_failed();
                self.stats.update(|s| s.decode_failures += 1);
            }
            ChannelNotification::RetriesExhausted { .. } => {}
        }
    }

    /// Disconnect and wait, bounded, for the channel to report `Closed`.
    async fn shutdown(&self, notifications: &mut broadcast::Receiver<ChannelNotification>) {
        self.channel.disconnect();

        let limit = Duration::from_millis(self.config.channel.close_timeout_ms) + SHUTDOWN_GRACE;
        let closed = tokio::time::timeout(limit, async {
            while self.channel.state() != ChannelState::Closed {
                match notifications.recv().await {
                    Ok(notification) => self.observe(notification),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
        .await;

        match closed {
            Ok(()) => info!("Event channel closed"),
            Err(_) => warn!(
                state = %self.channel.state(),
                "Event channel did not close in time"
            ),
        }
        Metrics::channel_state_set(self.channel.state().as_str());
    }
}
