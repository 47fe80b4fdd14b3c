//! Structured progress output of host tasks

use std::sync::Arc;

use chrono::Utc;
use deployd_api::{Event, JobKey, ProgressLevel, ProgressRecord};
use tracing::{debug, error, info, warn};

use crate::events::bus::EventBus;

/// Destination for progress records written by host tasks
pub trait ProgressSink: Send + Sync {
    fn record(&self, record: &ProgressRecord);
}

/// Forwards records to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn record(&self, r: &ProgressRecord) {
        match r.level {
            ProgressLevel::Debug => {
                debug!(job = %r.job, host = %r.host, task = %r.task, step = %r.step, "{}", r.message)
            }
            ProgressLevel::Info => {
                info!(job = %r.job, host = %r.host, task = %r.task, step = %r.step, "{}", r.message)
            }
            ProgressLevel::Warn => {
                warn!(job = %r.job, host = %r.host, task = %r.task, step = %r.step, "{}", r.message)
            }
            ProgressLevel::Error => {
                error!(job = %r.job, host = %r.host, task = %r.task, step = %r.step, "{}", r.message)
            }
        }
    }
}

/// Publishes records on the event bus as [`Event::Progress`]
#[derive(Clone)]
pub struct BusSink {
    bus: EventBus,
    min_level: ProgressLevel,
}

impl BusSink {
    /// Publish records at `Info` and above
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            min_level: ProgressLevel::Info,
        }
    }

    pub fn with_min_level(mut self, level: ProgressLevel) -> Self {
        self.min_level = level;
        self
    }
}

fn rank(level: ProgressLevel) -> u8 {
    match level {
        ProgressLevel::Debug => 0,
        ProgressLevel::Info => 1,
        ProgressLevel::Warn => 2,
        ProgressLevel::Error => 3,
    }
}

impl ProgressSink for BusSink {
    fn record(&self, record: &ProgressRecord) {
        if rank(record.level) >= rank(self.min_level) {
            self.bus.publish(Event::Progress(record.clone()));
        }
    }
}

/// Writes every record to each inner sink in order
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ProgressSink for FanoutSink {
    fn record(&self, record: &ProgressRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }
}

/// Stamps records with the job, host and task they belong to
#[derive(Clone)]
pub struct Progress {
    sink: Arc<dyn ProgressSink>,
    job: JobKey,
    host: String,
    task: &'static str,
}

impl Progress {
    pub fn new(sink: Arc<dyn ProgressSink>, job: JobKey, host: &str, task: &'static str) -> Self {
        Self {
            sink,
            job,
            host: host.to_string(),
            task,
        }
    }

    pub fn emit(&self, level: ProgressLevel, step: &str, message: impl Into<String>) {
        self.sink.record(&ProgressRecord {
            job: self.job.clone(),
            host: self.host.clone(),
            task: self.task.to_string(),
            step: step.to_string(),
            level,
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn debug(&self, step: &str, message: impl Into<String>) {
        self.emit(ProgressLevel::Debug, step, message);
    }

    pub fn info(&self, step: &str, message: impl Into<String>) {
        self.emit(ProgressLevel::Info, step, message);
    }

    pub fn warn(&self, step: &str, message: impl Into<String>) {
        self.emit(ProgressLevel::Warn, step, message);
    }

    pub fn error(&self, step: &str, message: impl Into<String>) {
        self.emit(ProgressLevel::Error, step, message);
    }
}
