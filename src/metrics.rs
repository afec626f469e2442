//! Run statistics.
//!
//! A [`MetricsCollector`] attached to a [`BatchRunner`](crate::runner::BatchRunner) with
//! `with_metrics` counts what the runner did:
//!
//! | name                 | meaning                                       |
//! |----------------------|-----------------------------------------------|
//! | `runs_serial`        | runs that took the serial fast path           |
//! | `runs_parallel`      | runs that dispatched tasks to the executor    |
//! | `tasks_submitted`    | tasks handed to the executor                  |
//! | `runs_failed`        | runs that ended in a task failure             |
//! | `elements_processed` | elements consumed by successful runs          |
//!
//! plus the start and end time of the most recent run. Callers may register their
//! own [`Metric`]s alongside.
//!
//! Counters are safe to share between concurrent runs. The start and end times are
//! not: each run overwrites them, so with overlapping runs [`MetricsCollector::elapsed`]
//! may pair the start of one run with the end of another. Give each concurrent runner
//! its own collector when run timings matter.
//!
//! ```no_run
//! use ironbatch::metrics::MetricsCollector;
//! use ironbatch::runner::BatchRunner;
//!
//! # fn main() -> anyhow::Result<()> {
//! let metrics = MetricsCollector::new();
//! let runner = BatchRunner::default().with_metrics(metrics.clone());
//! // ... runs ...
//! metrics.print();
//! metrics.save_to_file("metrics.json")?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A named value reported by a [`MetricsCollector`].
pub trait Metric: Send + Sync + Any {
    fn name(&self) -> &str;

    fn value(&self) -> Value;

    fn description(&self) -> Option<&str> {
        None
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Thread-safe, cheaply cloneable metric registry.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsCollectorInner>>,
}

#[derive(Default)]
struct MetricsCollectorInner {
    metrics: HashMap<String, Box<dyn Metric>>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric, replacing any existing metric of the same name.
    pub fn register(&self, metric: Box<dyn Metric>) {
        self.inner
            .lock()
            .metrics
            .insert(metric.name().to_string(), metric);
    }

    pub fn record_start(&self) {
        self.inner.lock().start_time = Some(Instant::now());
    }

    pub fn record_end(&self) {
        self.inner.lock().end_time = Some(Instant::now());
    }

    /// Duration between the last recorded start and end.
    ///
    /// Only meaningful when runs sharing this collector do not overlap.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match (inner.start_time, inner.end_time) {
            (Some(start), Some(end)) if end >= start => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Add `value` to the counter `name`, creating it at zero if needed.
    ///
    /// A non-counter metric registered under `name` is replaced.
    pub fn increment_counter(&self, name: &str, value: u64) {
        let mut inner = self.inner.lock();
        if let Some(counter) = inner
            .metrics
            .get_mut(name)
            .and_then(|m| m.as_any_mut().downcast_mut::<CounterMetric>())
        {
            counter.count += value;
            return;
        }
        inner.metrics.insert(
            name.to_string(),
            Box::new(CounterMetric::with_value(name, value)),
        );
    }

    /// Current value of the counter `name`, or `0`.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .metrics
            .get_mut(name)
            .and_then(|m| m.as_any_mut().downcast_mut::<CounterMetric>())
            .map_or(0, |c| c.count)
    }

    /// All metrics (and the last run's elapsed time) as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut out = serde_json::Map::new();
        for (name, value, description) in self.entries() {
            let mut obj = serde_json::Map::new();
            obj.insert("value".to_string(), value);
            if let Some(desc) = description {
                obj.insert("description".to_string(), json!(desc));
            }
            out.insert(name, Value::Object(obj));
        }
        if let Some(elapsed) = self.elapsed() {
            out.insert(
                "execution_time_ms".to_string(),
                json!({
                    "value": elapsed.as_millis(),
                    "description": "Duration of the most recent run in milliseconds",
                }),
            );
        }
        Value::Object(out)
    }

    /// Print all metrics to stdout, sorted by name.
    pub fn print(&self) {
        println!("\n========== Batch Metrics ==========");
        if let Some(elapsed) = self.elapsed() {
            println!(
                "Last run: {:.3}s ({} ms)",
                elapsed.as_secs_f64(),
                elapsed.as_millis()
            );
            println!("-----------------------------------");
        }
        let mut entries = self.entries();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value, description) in entries {
            match description {
                Some(desc) => println!("{name}: {value} ({desc})"),
                None => println!("{name}: {value}"),
            }
        }
        println!("===================================\n");
    }

    /// Write [`to_json`](Self::to_json) to `path`, pretty-printed.
    ///
    /// # Errors
    ///
    /// If the file cannot be created or written.
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path)?;
        file.write_all(formatted.as_bytes())?;
        Ok(())
    }

    /// Name → value for every registered metric.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.entries()
            .into_iter()
            .map(|(name, value, _)| (name, value))
            .collect()
    }

    fn entries(&self) -> Vec<(String, Value, Option<String>)> {
        self.inner
            .lock()
            .metrics
            .iter()
            .map(|(name, m)| (name.clone(), m.value(), m.description().map(str::to_string)))
            .collect()
    }
}

/// A monotonically increasing count.
pub struct CounterMetric {
    name: String,
    count: u64,
}

impl CounterMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_value(name, 0)
    }

    pub fn with_value(name: impl Into<String>, count: u64) -> Self {
        Self {
            name: name.into(),
            count,
        }
    }
}

impl Metric for CounterMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.count)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A point-in-time reading.
pub struct GaugeMetric {
    name: String,
    value: f64,
    description: Option<String>,
}

impl GaugeMetric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Metric for GaugeMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.value)
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
