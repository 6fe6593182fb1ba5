//! Event system for the fetch engine.
//!
//! Provides hooks for logging and custom reactions around strategy attempts,
//! challenge handling, proxy health transitions and degraded modes.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Emitted right before a strategy issues its request.
#[derive(Debug, Clone)]
pub struct AttemptStartedEvent {
    pub request_id: String,
    pub url: String,
    pub strategy: &'static str,
    pub attempt: u32,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Emitted once a strategy attempt has produced an outcome.
#[derive(Debug, Clone)]
pub struct AttemptFinishedEvent {
    pub request_id: String,
    pub url: String,
    pub strategy: &'static str,
    pub attempt: u32,
    pub success: bool,
    pub status: Option<u16>,
    pub latency: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChallengeEvent {
    pub url: String,
    pub challenge_type: String,
    pub solved: bool,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProxyHealthEvent {
    pub endpoint: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub timestamp: DateTime<Utc>,
}

/// A component switched to a degraded mode for the rest of its lifetime.
#[derive(Debug, Clone)]
pub struct DegradedEvent {
    pub component: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum FetchEvent {
    AttemptStarted(AttemptStartedEvent),
    AttemptFinished(AttemptFinishedEvent),
    Challenge(ChallengeEvent),
    ProxyHealth(ProxyHealthEvent),
    Degraded(DegradedEvent),
}

impl FetchEvent {
    pub fn challenge(
        url: impl Into<String>,
        challenge_type: impl Into<String>,
        solved: bool,
        detail: Option<String>,
    ) -> Self {
        FetchEvent::Challenge(ChallengeEvent {
            url: url.into(),
            challenge_type: challenge_type.into(),
            solved,
            detail,
            timestamp: Utc::now(),
        })
    }

    pub fn degraded(component: impl Into<String>, reason: impl Into<String>) -> Self {
        FetchEvent::Degraded(DegradedEvent {
            component: component.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        })
    }
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &FetchEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Dispatcher pre-wired with a [`LoggingHandler`].
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: FetchEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &FetchEvent) {
        match event {
            FetchEvent::AttemptStarted(start) => {
                log::debug!(
                    "[{}] -> {} {} attempt {} proxy={}",
                    start.request_id,
                    start.strategy,
                    start.url,
                    start.attempt,
                    start.proxy.as_deref().unwrap_or("none")
                );
            }
            FetchEvent::AttemptFinished(done) => {
                log::debug!(
                    "[{}] <- {} {} -> {:?} success={} ({:.2}s){}",
                    done.request_id,
                    done.strategy,
                    done.url,
                    done.status,
                    done.success,
                    done.latency.as_secs_f64(),
                    done.error
                        .as_deref()
                        .map(|err| format!(" error={err}"))
                        .unwrap_or_default()
                );
            }
            FetchEvent::Challenge(challenge) => {
                log::info!(
                    "challenge {} ({}) solved={}",
                    challenge.url,
                    challenge.challenge_type,
                    challenge.solved
                );
            }
            FetchEvent::ProxyHealth(health) => {
                if health.healthy {
                    log::info!("proxy {} healthy again", health.endpoint);
                } else {
                    log::warn!(
                        "proxy {} marked unhealthy after {} failures",
                        health.endpoint,
                        health.consecutive_failures
                    );
                }
            }
            FetchEvent::Degraded(degraded) => {
                log::warn!("{} degraded: {}", degraded.component, degraded.reason);
            }
        }
    }
}
