//! In-process metrics.
//!
//! Atomic counters and label maps covering the streaming control plane:
//! session lifecycle, readiness outcomes, routing decisions, admission.
//! Exposed as a plain-text snapshot at `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Metrics collector for the gateway.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    // Session metrics
    sessions_started: AtomicU64,
    sessions_active: AtomicU64,
    session_exits: DashMap<String, u64>,
    startup_duration_total_ms: AtomicU64,
    startup_count: AtomicU64,

    // Readiness metrics, labelled by outcome
    readiness_outcomes: DashMap<String, u64>,

    // Routing metrics, labelled by decision:reason
    route_decisions: DashMap<String, u64>,

    // Admission
    admission_rejected: AtomicU64,
    idle_disconnects: AtomicU64,

    // Scan
    scan_runs: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session exit with its outcome label (`clean`, `stalled`,
    /// `start_timeout`, `stream_connect_reset`, `io_error`, ...).
    pub fn session_exited(&self, label: &str) {
        self.sessions_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            })
            .ok();
        *self.session_exits.entry(label.to_string()).or_insert(0) += 1;
    }

    pub fn session_ready(&self, startup_ms: u64) {
        self.startup_duration_total_ms
            .fetch_add(startup_ms, Ordering::Relaxed);
        self.startup_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn readiness_outcome(&self, label: &str) {
        *self.readiness_outcomes.entry(label.to_string()).or_insert(0) += 1;
    }

    pub fn route_decision(&self, decision: &str, reason: &str) {
        *self
            .route_decisions
            .entry(format!("{decision}:{reason}"))
            .or_insert(0) += 1;
    }

    pub fn admission_rejected(&self) {
        self.admission_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_disconnect(&self) {
        self.idle_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scan_run(&self) {
        self.scan_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_active(&self) -> u64 {
        self.sessions_active.load(Ordering::Relaxed)
    }

    /// Render the collector as plain-text exposition.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let mut counter = |name: &str, value: u64| {
            out.push_str(&format!("zapgate_{name} {value}\n"));
        };

        counter(
            "sessions_started_total",
            self.sessions_started.load(Ordering::Relaxed),
        );
        counter("sessions_active", self.sessions_active.load(Ordering::Relaxed));
        counter(
            "admission_rejected_total",
            self.admission_rejected.load(Ordering::Relaxed),
        );
        counter(
            "idle_disconnects_total",
            self.idle_disconnects.load(Ordering::Relaxed),
        );
        counter("scan_runs_total", self.scan_runs.load(Ordering::Relaxed));
        counter(
            "session_startup_ms_total",
            self.startup_duration_total_ms.load(Ordering::Relaxed),
        );
        counter(
            "session_startup_count",
            self.startup_count.load(Ordering::Relaxed),
        );

        let mut labelled: Vec<(String, String, u64)> = Vec::new();
        for entry in self.session_exits.iter() {
            labelled.push(("session_exits_total".into(), entry.key().clone(), *entry.value()));
        }
        for entry in self.readiness_outcomes.iter() {
            labelled.push((
                "readiness_outcomes_total".into(),
                entry.key().clone(),
                *entry.value(),
            ));
        }
        for entry in self.route_decisions.iter() {
            labelled.push((
                "route_decisions_total".into(),
                entry.key().clone(),
                *entry.value(),
            ));
        }
        labelled.sort();
        for (name, label, value) in labelled {
            out.push_str(&format!("zapgate_{name}{{label=\"{label}\"}} {value}\n"));
        }

        out
    }
}
