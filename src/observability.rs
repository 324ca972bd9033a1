use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[cfg(feature = "metrics-server")]
pub mod server;

pub const STAGE_SANITIZE: &str = "sanitize";
pub const STAGE_CACHE_LOOKUP: &str = "cache_lookup";
pub const STAGE_EXECUTE: &str = "execute";
pub const STAGE_LOCATE: &str = "locate";
pub const STAGE_PUBLISH: &str = "publish";
pub const STAGE_CACHE_STORE: &str = "cache_store";
pub const STAGE_MERGE: &str = "merge";

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub renders: u64,
    pub degraded: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn degraded_total(&self) -> u64 {
        self.degraded.values().sum()
    }
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        self.update(|m| m.total_duration_ms = duration.as_secs_f64() * 1_000.0);
    }

    pub fn record_request(&self) {
        self.update(|m| m.requests += 1);
    }

    pub fn record_cache_hit(&self) {
        self.update(|m| m.cache_hits += 1);
    }

    pub fn record_cache_miss(&self) {
        self.update(|m| m.cache_misses += 1);
    }

    pub fn record_render(&self) {
        self.update(|m| m.renders += 1);
    }

    pub fn record_degraded(&self, reason: &str) {
        self.update(|m| *m.degraded.entry(reason.to_string()).or_default() += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        self.update(|m| *m = MetricsSnapshot::default());
    }

    fn update(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut guard) = self.inner.lock() {
            f(&mut guard);
        }
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        let duration_ms = duration.as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms, "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        requests = snapshot.requests,
        cache_hits = snapshot.cache_hits,
        cache_misses = snapshot.cache_misses,
        renders = snapshot.renders,
        degraded = snapshot.degraded_total(),
        "Render metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
    for (reason, count) in &snapshot.degraded {
        info!(reason = reason.as_str(), count, "Degraded results");
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let counters = [
            ("render_requests_total", "Render requests processed", self.requests),
            ("render_cache_hits_total", "Requests served from the content cache", self.cache_hits),
            ("render_cache_misses_total", "Content cache misses", self.cache_misses),
            ("render_invocations_total", "Renderer subprocess invocations", self.renders),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} counter\n"));
            output.push_str(&format!("{name} {value}\n"));
        }

        output.push_str("# HELP render_degraded_total Requests answered with the placeholder\n");
        output.push_str("# TYPE render_degraded_total counter\n");
        for (reason, count) in &self.degraded {
            output.push_str(&format!(
                "render_degraded_total{{reason=\"{}\"}} {}\n",
                reason, count
            ));
        }

        output.push_str("# HELP render_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE render_stage_calls_total counter\n");
        output.push_str(
            "# HELP render_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE render_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP render_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE render_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "render_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "render_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "render_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP render_batch_duration_seconds Wall time of the last batch\n");
        output.push_str("# TYPE render_batch_duration_seconds gauge\n");
        output.push_str(&format!(
            "render_batch_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_timer_records_on_drop() {
        let metrics = MetricsCollector::new();
        {
            let _timer = metrics.start_stage(STAGE_EXECUTE);
        }
        let _second = metrics.start_stage(STAGE_EXECUTE);
        drop(_second);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stages[STAGE_EXECUTE].calls, 2);
    }

    #[test]
    fn prometheus_text_includes_counters() {
        let metrics = MetricsCollector::new();
        metrics.record_request();
        metrics.record_cache_miss();
        metrics.record_render();
        metrics.record_degraded("render_timeout");
        metrics.record_degraded("render_timeout");
        let text = metrics.snapshot().to_prometheus();
        assert!(text.contains("render_requests_total 1"));
        assert!(text.contains("render_invocations_total 1"));
        assert!(text.contains("render_degraded_total{reason=\"render_timeout\"} 2"));
        assert_eq!(metrics.snapshot().degraded_total(), 2);
    }
}
