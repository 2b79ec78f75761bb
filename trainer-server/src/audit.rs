//! Append-only audit log
//!
//! Every significant decision (change queued, host joined or died, provider
//! call failed, configuration edited) lands here as a small event, queryable
//! by application name. Retention is a bounded ring buffer; old events fall
//! off the front.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuditEvent {
    pub subsystem: String,
    pub level: AuditLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct AuditLog {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
            clock,
        }
    }

    pub fn insert(
        &self,
        subsystem: &str,
        level: AuditLevel,
        message: impl Into<String>,
        application: Option<&str>,
        host: Option<&str>,
    ) {
        let event = AuditEvent {
            subsystem: subsystem.to_string(),
            level,
            message: message.into(),
            application: application.map(str::to_string),
            host: host.map(str::to_string),
            timestamp: self.clock.now(),
        };

        match level {
            AuditLevel::Info => tracing::info!(
                subsystem = %event.subsystem,
                application = event.application.as_deref().unwrap_or(""),
                host = event.host.as_deref().unwrap_or(""),
                "{}",
                event.message
            ),
            AuditLevel::Warn => tracing::warn!(
                subsystem = %event.subsystem,
                application = event.application.as_deref().unwrap_or(""),
                host = event.host.as_deref().unwrap_or(""),
                "{}",
                event.message
            ),
            AuditLevel::Error => tracing::error!(
                subsystem = %event.subsystem,
                application = event.application.as_deref().unwrap_or(""),
                host = event.host.as_deref().unwrap_or(""),
                "{}",
                event.message
            ),
        }

        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Events newest first, optionally restricted to one application.
    pub fn query(&self, application: Option<&str>) -> Vec<AuditEvent> {
        let events = self.events.lock();
        events
            .iter()
            .rev()
            .filter(|e| match application {
                Some(app) => e.application.as_deref() == Some(app),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
