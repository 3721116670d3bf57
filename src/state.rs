//! # Application State
//!
//! Shared by every HTTP handler and every media stream actor through
//! `web::Data<AppState>`. Cloning is cheap: everything inside is behind an `Arc`.

use crate::call::SessionRegistry;
use crate::config::AppConfig;
use crate::error::AppResult;
use crate::extraction::ExtractionClient;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Loaded once at startup, read-only afterwards
    pub config: Arc<AppConfig>,

    /// Live calls
    pub registry: SessionRegistry,

    /// `None` when no extraction credential is configured
    pub extractor: Option<Arc<ExtractionClient>>,

    pub metrics: Arc<CallMetrics>,

    pub start_time: Instant,
}

/// Process-lifetime counters reported by the health endpoint.
#[derive(Debug, Default)]
pub struct CallMetrics {
    pub calls_started: AtomicU64,
    pub calls_completed: AtomicU64,
    pub decode_errors: AtomicU64,
    pub upstream_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallMetricsSnapshot {
    pub calls_started: u64,
    pub calls_completed: u64,
    pub decode_errors: u64,
    pub upstream_failures: u64,
}

impl CallMetrics {
    pub fn snapshot(&self) -> CallMetricsSnapshot {
        CallMetricsSnapshot {
            calls_started: self.calls_started.load(Ordering::Relaxed),
            calls_completed: self.calls_completed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
        }
    }

    pub fn record_call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_completed(&self) {
        self.calls_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl AppState {
    /// Build the state, creating the extraction client when it is configured.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let extractor = if config.extraction_enabled() {
            Some(Arc::new(ExtractionClient::new(config.extraction.clone())?))
        } else {
            None
        };

        Ok(Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            extractor,
            metrics: Arc::new(CallMetrics::default()),
            start_time: Instant::now(),
        })
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
