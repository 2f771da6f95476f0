//! Event system for the mirror engine.
//!
//! Every mirror call publishes typed lifecycle events. Handlers can log them,
//! count them, or feed them into external telemetry.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheKey;

/// Why a cached clearance was thrown away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// Caller asked to bypass the cache.
    Bypass,
    /// The origin answered 403 with the cached credentials.
    Forbidden,
}

#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub key: CacheKey,
    pub method: Method,
    pub path: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub key: CacheKey,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CompletedEvent {
    pub key: CacheKey,
    pub status: u16,
    pub attempts: u32,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum MirrorEvent {
    CacheHit {
        key: CacheKey,
    },
    Solved {
        key: CacheKey,
        solver: &'static str,
        cookies: usize,
        elapsed: Duration,
    },
    SolveFailed {
        key: CacheKey,
        error: String,
    },
    Invalidated {
        key: CacheKey,
        reason: InvalidationReason,
    },
    Attempt(AttemptEvent),
    Retry(RetryEvent),
    Completed(CompletedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &MirrorEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Dispatcher with the [`LoggingHandler`] already registered.
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: MirrorEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &MirrorEvent) {
        match event {
            MirrorEvent::CacheHit { key } => {
                log::debug!("clearance cache hit for {key}");
            }
            MirrorEvent::Solved {
                key,
                solver,
                cookies,
                elapsed,
            } => {
                log::info!(
                    "{solver} solver produced {cookies} cookie(s) for {key} in {}ms",
                    elapsed.as_millis()
                );
            }
            MirrorEvent::SolveFailed { key, error } => {
                log::error!("failed to obtain clearance for {key}: {error}");
            }
            MirrorEvent::Invalidated { key, reason } => match reason {
                InvalidationReason::Bypass => {
                    log::info!("cache bypass requested, dropped clearance for {key}");
                }
                InvalidationReason::Forbidden => {
                    log::warn!("origin {key} answered 403, dropped clearance");
                }
            },
            MirrorEvent::Attempt(attempt) => {
                log::info!(
                    "mirroring {} {}{} (attempt {}/{})",
                    attempt.method,
                    attempt.key,
                    attempt.path,
                    attempt.attempt,
                    attempt.max_attempts
                );
            }
            MirrorEvent::Retry(retry) => {
                log::warn!(
                    "retry {} attempt {} after {:.2}s: {}",
                    retry.key,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            MirrorEvent::Completed(done) => {
                log::info!(
                    "request to {} completed with status {} after {} attempt(s) ({:.2}s)",
                    done.key,
                    done.status,
                    done.attempts,
                    done.latency.as_secs_f64()
                );
            }
        }
    }
}
