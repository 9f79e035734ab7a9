//! Observability collaborator.
//!
//! Backends report connection and query activity through an [`Observer`].
//! [`TracingObserver`] forwards log events to `tracing` and metrics to the
//! `metrics` facade; [`MemoryObserver`] records events so tests can assert
//! on them.

use crate::error::LinkError;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Dimensions attached to an event.
pub type Dimensions = serde_json::Map<String, JsonValue>;

/// Sink for log events and metrics.
pub trait Observer: Send + Sync {
    fn debug(&self, message: &str, dims: &Dimensions);

    fn info(&self, message: &str, dims: &Dimensions);

    /// Record a counter value.
    fn count(&self, name: &str, value: u64, dims: &Dimensions);

    /// Record a measurement, durations in milliseconds.
    fn magnitude(&self, name: &str, value: f64, dims: &Dimensions);

    /// Report a failure with its context.
    fn fail(&self, message: &str, error: &LinkError, dims: &Dimensions);
}

/// Forwards events to the `tracing` subscriber. Counts and magnitudes are
/// also recorded as `metrics` counters and histograms, labelled with their
/// dimensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn debug(&self, message: &str, dims: &Dimensions) {
        tracing::debug!(dims = %JsonValue::Object(dims.clone()), "{message}");
    }

    fn info(&self, message: &str, dims: &Dimensions) {
        tracing::info!(dims = %JsonValue::Object(dims.clone()), "{message}");
    }

    fn count(&self, name: &str, value: u64, dims: &Dimensions) {
        let labels = metric_labels(dims);
        metrics::counter!(name.to_string(), &labels).increment(value);
        tracing::debug!(metric = name, value, dims = %JsonValue::Object(dims.clone()), "count");
    }

    fn magnitude(&self, name: &str, value: f64, dims: &Dimensions) {
        let labels = metric_labels(dims);
        metrics::histogram!(name.to_string(), &labels).record(value);
        tracing::debug!(metric = name, value, dims = %JsonValue::Object(dims.clone()), "magnitude");
    }

    fn fail(&self, message: &str, error: &LinkError, dims: &Dimensions) {
        tracing::error!(error = %error, dims = %JsonValue::Object(dims.clone()), "{message}");
    }
}

/// Metric labels from dimensions. Strings are used as-is, other values in
/// their JSON form.
fn metric_labels(dims: &Dimensions) -> Vec<(String, String)> {
    dims.iter()
        .map(|(key, value)| {
            let value = match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// A recorded observer event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Debug {
        message: String,
        dims: Dimensions,
    },
    Info {
        message: String,
        dims: Dimensions,
    },
    Count {
        name: String,
        value: u64,
        dims: Dimensions,
    },
    Magnitude {
        name: String,
        value: f64,
        dims: Dimensions,
    },
    Fail {
        message: String,
        error: String,
        dims: Dimensions,
    },
}

impl Event {
    /// Metric name for counts and magnitudes.
    pub fn metric(&self) -> Option<&str> {
        match self {
            Self::Count { name, .. } | Self::Magnitude { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn dims(&self) -> &Dimensions {
        match self {
            Self::Debug { dims, .. }
            | Self::Info { dims, .. }
            | Self::Count { dims, .. }
            | Self::Magnitude { dims, .. }
            | Self::Fail { dims, .. } => dims,
        }
    }
}

/// Records every event in memory. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryObserver {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// All events recorded so far, in order.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of recorded metrics, in emission order.
    pub fn metrics(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|event| event.metric().map(str::to_string))
            .collect()
    }

    /// Recorded info events as (message, dimensions).
    pub fn infos(&self) -> Vec<(String, Dimensions)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Info { message, dims } => Some((message, dims)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Observer for MemoryObserver {
    fn debug(&self, message: &str, dims: &Dimensions) {
        self.push(Event::Debug {
            message: message.to_string(),
            dims: dims.clone(),
        });
    }

    fn info(&self, message: &str, dims: &Dimensions) {
        self.push(Event::Info {
            message: message.to_string(),
            dims: dims.clone(),
        });
    }

    fn count(&self, name: &str, value: u64, dims: &Dimensions) {
        self.push(Event::Count {
            name: name.to_string(),
            value,
            dims: dims.clone(),
        });
    }

    fn magnitude(&self, name: &str, value: f64, dims: &Dimensions) {
        self.push(Event::Magnitude {
            name: name.to_string(),
            value,
            dims: dims.clone(),
        });
    }

    fn fail(&self, message: &str, error: &LinkError, dims: &Dimensions) {
        self.push(Event::Fail {
            message: message.to_string(),
            error: error.to_string(),
            dims: dims.clone(),
        });
    }
}

/// Measures a named duration and reports it as a magnitude.
#[derive(Debug)]
pub struct Timer {
    name: String,
    started: Instant,
}

impl Timer {
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started: Instant::now(),
        }
    }

    /// Milliseconds since the timer started.
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1e3
    }

    /// Emit the elapsed time and return it in milliseconds.
    pub fn finish(self, observer: &dyn Observer, dims: &Dimensions) -> f64 {
        let ms = self.elapsed_ms();
        observer.magnitude(&self.name, ms, dims);
        ms
    }
}

/// Build dimensions from key/value pairs.
pub fn dimensions<I, K>(pairs: I) -> Dimensions
where
    I: IntoIterator<Item = (K, JsonValue)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
