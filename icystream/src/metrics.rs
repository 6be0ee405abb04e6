//! Métriques de bande passante de la boucle de copie
//!
//! [`BandwidthMetrics`] tient des compteurs atomiques sur toute la durée de vie
//! et une fenêtre glissante des itérations récentes. [`MetricsSnapshot`] en est
//! la vue sérialisable exportée par l'endpoint de métriques.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Durée par défaut de la fenêtre glissante
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes: u64,
    elapsed: Duration,
}

/// Compteurs de débit du relais
#[derive(Debug)]
pub struct BandwidthMetrics {
    bytes_total: AtomicU64,
    busy_nanos: AtomicU64,
    iterations: AtomicU64,
    errors: AtomicU64,
    window_len: Duration,
    window: Mutex<VecDeque<Sample>>,
}

impl Default for BandwidthMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl BandwidthMetrics {
    #[must_use]
    pub fn new(window_len: Duration) -> Self {
        Self {
            bytes_total: AtomicU64::new(0),
            busy_nanos: AtomicU64::new(0),
            iterations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            window_len,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Enregistre une itération ayant copié `bytes` en `elapsed`
    pub fn record(&self, bytes: u64, elapsed: Duration) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
        self.bytes_total.fetch_add(bytes, Ordering::Relaxed);
        self.busy_nanos
            .fetch_add(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);

        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.push_back(Sample {
            at: now,
            bytes,
            elapsed,
        });
        Self::evict(&mut window, now, self.window_len);
    }

    /// Compte une itération interrompue
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn evict(window: &mut VecDeque<Sample>, now: Instant, len: Duration) {
        while let Some(front) = window.front() {
            if now.duration_since(front.at) > len {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let lifetime_bytes = self.bytes_total.load(Ordering::Relaxed);
        let lifetime_seconds = Duration::from_nanos(self.busy_nanos.load(Ordering::Relaxed)).as_secs_f64();

        let (window_bytes, window_seconds) = {
            let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            Self::evict(&mut window, Instant::now(), self.window_len);
            window.iter().fold((0u64, 0f64), |(b, s), sample| {
                (b + sample.bytes, s + sample.elapsed.as_secs_f64())
            })
        };

        MetricsSnapshot {
            lifetime_bytes,
            lifetime_bits: lifetime_bytes * 8,
            lifetime_seconds,
            lifetime_bps: rate(lifetime_bytes * 8, lifetime_seconds),
            window_bits: window_bytes * 8,
            window_seconds,
            window_bps: rate(window_bytes * 8, window_seconds),
            iterations: self.iterations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Format texte Prometheus
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        self.snapshot().to_prometheus()
    }
}

fn rate(bits: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        bits as f64 / seconds
    } else {
        0.0
    }
}

/// Instantané de [`BandwidthMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub lifetime_bytes: u64,
    pub lifetime_bits: u64,
    pub lifetime_seconds: f64,
    pub lifetime_bps: f64,
    pub window_bits: u64,
    pub window_seconds: f64,
    pub window_bps: f64,
    pub iterations: u64,
    pub errors: u64,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let mut metric = |name: &str, kind: &str, help: &str, value: String| {
            let _ = writeln!(out, "# HELP icycat_{name} {help}");
            let _ = writeln!(out, "# TYPE icycat_{name} {kind}");
            let _ = writeln!(out, "icycat_{name} {value}");
        };

        metric("bits_total", "counter", "Bits relayed since start.", self.lifetime_bits.to_string());
        metric("busy_seconds_total", "counter", "Time spent copying.", self.lifetime_seconds.to_string());
        metric("bandwidth_bps", "gauge", "Lifetime average bandwidth.", self.lifetime_bps.to_string());
        metric("window_bits", "gauge", "Bits relayed in the rolling window.", self.window_bits.to_string());
        metric("window_bandwidth_bps", "gauge", "Bandwidth over the rolling window.", self.window_bps.to_string());
        metric("iterations_total", "counter", "Completed copy iterations.", self.iterations.to_string());
        metric("errors_total", "counter", "Interrupted copy iterations.", self.errors.to_string());
        out
    }
}
