//! Per-run log capture.
//!
//! [`RunLogLayer`] is a `tracing` layer that keeps every event emitted
//! inside a span carrying a `migration_id` field, so the logs of a run can
//! be served after the fact. The orchestrator runs each migration inside
//! such a span and its worker tasks inherit it.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as FmtWrite;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Lines kept per run; older lines are dropped first.
const MAX_LINES_PER_RUN: usize = 10_000;

/// Runs kept; the least recently started run is dropped first.
const MAX_RUNS: usize = 20;

/// One captured log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

impl LogLine {
    /// Whether the line is at least as severe as `min`.
    pub fn at_least(&self, min: Level) -> bool {
        match self.level.parse::<Level>() {
            // `Level` orders ERROR as the smallest.
            Ok(level) => level <= min,
            Err(_) => true,
        }
    }
}

#[derive(Default)]
struct Buffers {
    runs: HashMap<String, VecDeque<LogLine>>,
    order: VecDeque<String>,
}

/// Shared store of captured lines, keyed by migration id.
#[derive(Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<Buffers>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, migration_id: &str, line: LogLine) {
        let mut buffers = self.inner.lock();
        if !buffers.runs.contains_key(migration_id) {
            buffers.order.push_back(migration_id.to_string());
            while buffers.order.len() > MAX_RUNS {
                if let Some(oldest) = buffers.order.pop_front() {
                    buffers.runs.remove(&oldest);
                }
            }
        }
        let lines = buffers.runs.entry(migration_id.to_string()).or_default();
        if lines.len() >= MAX_LINES_PER_RUN {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Captured lines of a run, oldest first.
    pub fn lines(&self, migration_id: &str) -> Vec<LogLine> {
        self.inner
            .lock()
            .runs
            .get(migration_id)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Migration id stored in the extensions of a run span.
struct RunId(String);

/// Layer that routes events inside run spans to a [`LogBuffer`].
pub struct RunLogLayer {
    buffer: LogBuffer,
}

impl RunLogLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S> Layer<S> for RunLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = RunIdVisitor(None);
        attrs.record(&mut visitor);
        if let (Some(run_id), Some(span)) = (visitor.0, ctx.span(id)) {
            span.extensions_mut().insert(RunId(run_id));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        let run_id = scope.from_root().find_map(|span| {
            let extensions = span.extensions();
            let run_id = extensions.get::<RunId>().map(|r| r.0.clone());
            run_id
        });
        let Some(run_id) = run_id else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        self.buffer.push(
            &run_id,
            LogLine {
                timestamp: Utc::now(),
                level: metadata.level().to_string(),
                target: metadata.target().to_string(),
                message: visitor.message,
            },
        );
    }
}

struct RunIdVisitor(Option<String>);

impl Visit for RunIdVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "migration_id" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "migration_id" {
            self.0 = Some(format!("{:?}", value).trim_matches('"').to_string());
        }
    }
}

/// Visitor for extracting the message from a tracing event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl MessageVisitor {
    fn field(&mut self, name: &str, value: impl std::fmt::Display) {
        if !self.message.is_empty() {
            self.message.push(' ');
        }
        let _ = write!(self.message, "{}={}", name, value);
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            self.field(field.name(), format!("{:?}", value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.field(field.name(), value);
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.field(field.name(), value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.field(field.name(), value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.field(field.name(), value);
    }
}
