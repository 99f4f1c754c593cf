//! Bounded in-memory event buffer
//!
//! The collector keeps the most recent debug events in a ring buffer and
//! hands them off in batches:
//! - Interval flush from a background task (`start()`)
//! - High-water-mark flush checked on every insert
//! - Manual `flush()`
//!
//! Every flush is a swap-and-clear under one lock, so two triggers racing
//! can never emit the same event twice. Flushed batches are published as
//! `DebugNotification::Flushed`; the collector never touches storage.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::config::{CollectorConfig, OverflowPolicy};
use crate::events::{DebugEvent, DebugEventType, DebugNotification, FlushTrigger, NotificationBus};
use crate::filter::SensitiveDataFilter;
use crate::record::{current_millis, RecordedError, RequestSnapshot, ResponseSnapshot};
use crate::task::{shutdown_requested, BackgroundTask};

#[derive(Default)]
struct BufferState {
    events: VecDeque<DebugEvent>,
    total_events: u64,
    events_by_type: BTreeMap<DebugEventType, u64>,
    dropped_events: u64,
    flush_count: u64,
    last_flush_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorStatistics {
    pub total_events: u64,
    pub events_by_type: BTreeMap<String, u64>,
    pub events_per_second: f64,
    pub buffered: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub dropped_events: u64,
    pub flush_count: u64,
    pub last_flush_time: Option<u64>,
}

pub struct EventCollector {
    config: CollectorConfig,
    filter: Arc<SensitiveDataFilter>,
    bus: NotificationBus,
    state: Mutex<BufferState>,
    started_at: Instant,
}

impl EventCollector {
    pub fn new(config: CollectorConfig, filter: Arc<SensitiveDataFilter>, bus: NotificationBus) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            config: CollectorConfig { capacity, ..config },
            filter,
            bus,
            state: Mutex::new(BufferState {
                events: VecDeque::with_capacity(capacity),
                ..BufferState::default()
            }),
            started_at: Instant::now(),
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Buffer one event; its payloads are filtered first
    pub fn collect(&self, mut event: DebugEvent) {
        event.data = self.filter.filter_value(&event.data);
        event.metadata = self.filter.filter_value(&event.metadata);

        let event_type = event.event_type;
        let capacity = self.config.capacity;
        let mut overflowed = None;
        let mut flushed = None;

        let utilization = {
            let mut state = self.state();

            if state.events.len() >= capacity {
                match self.config.overflow_policy {
                    OverflowPolicy::DropOldest => {
                        overflowed = state.events.pop_front().map(|e| e.id);
                        state.events.push_back(event);
                    }
                    OverflowPolicy::DropNewest => {
                        overflowed = Some(event.id);
                    }
                }
                state.dropped_events += 1;
            } else {
                state.events.push_back(event);
            }

            if !matches!(
                (&overflowed, self.config.overflow_policy),
                (Some(_), OverflowPolicy::DropNewest)
            ) {
                state.total_events += 1;
                *state.events_by_type.entry(event_type).or_insert(0) += 1;
            }

            if self.config.auto_flush && state.events.len() >= self.config.high_water_mark_len() {
                flushed = Some(Self::swap_out(&mut state));
            }

            state.events.len() as f64 / capacity as f64
        };

        crate::metrics::update_buffer_utilization(utilization);

        match overflowed {
            Some(dropped_event_id) => {
                tracing::warn!(
                    event_type = %event_type,
                    policy = ?self.config.overflow_policy,
                    capacity = capacity,
                    "Debug event buffer full, dropping event"
                );
                crate::metrics::record_buffer_overflow(match self.config.overflow_policy {
                    OverflowPolicy::DropOldest => "drop_oldest",
                    OverflowPolicy::DropNewest => "drop_newest",
                });
                self.bus.publish(DebugNotification::BufferOverflow {
                    dropped_event_id,
                    capacity,
                });
            }
            None => crate::metrics::record_event_collected(event_type.as_str()),
        }

        if let Some(events) = flushed {
            self.publish_flush(FlushTrigger::HighWaterMark, &events);
        }
    }

    pub fn collect_session_start(&self, session_id: &str, port: u16, metadata: Value) {
        self.collect(
            DebugEvent::new(
                DebugEventType::SessionStart,
                session_id,
                serde_json::json!({ "port": port }),
            )
            .with_metadata(metadata),
        );
    }

    pub fn collect_session_end(&self, session_id: &str, summary: Value) {
        self.collect(DebugEvent::new(DebugEventType::SessionEnd, session_id, summary));
    }

    pub fn collect_request(&self, session_id: &str, request_id: &str, request: &RequestSnapshot) {
        let data = serde_json::to_value(request).unwrap_or(Value::Null);
        self.collect(DebugEvent::new(DebugEventType::Request, session_id, data).with_request(request_id));
    }

    pub fn collect_response(&self, session_id: &str, request_id: &str, response: &ResponseSnapshot) {
        let data = serde_json::to_value(response).unwrap_or(Value::Null);
        self.collect(DebugEvent::new(DebugEventType::Response, session_id, data).with_request(request_id));
    }

    pub fn collect_module_input(&self, session_id: &str, request_id: &str, module_name: &str, input: &Value) {
        self.collect(
            DebugEvent::new(DebugEventType::ModuleInput, session_id, input.clone())
                .with_request(request_id)
                .with_module(module_name),
        );
    }

    pub fn collect_module_output(&self, session_id: &str, request_id: &str, module_name: &str, output: &Value) {
        self.collect(
            DebugEvent::new(DebugEventType::ModuleOutput, session_id, output.clone())
                .with_request(request_id)
                .with_module(module_name),
        );
    }

    pub fn collect_module_error(
        &self,
        session_id: &str,
        request_id: &str,
        module_name: &str,
        error: &RecordedError,
    ) {
        let data = serde_json::to_value(self.filter.filter_error(error)).unwrap_or(Value::Null);
        self.collect(
            DebugEvent::new(DebugEventType::ModuleError, session_id, data)
                .with_request(request_id)
                .with_module(module_name),
        );
    }

    pub fn collect_error(&self, session_id: &str, request_id: Option<&str>, error: &RecordedError) {
        let data = serde_json::to_value(self.filter.filter_error(error)).unwrap_or(Value::Null);
        let mut event = DebugEvent::new(DebugEventType::Error, session_id, data);
        if let Some(request_id) = request_id {
            event = event.with_request(request_id);
        }
        self.collect(event);
    }

    pub fn collect_custom(&self, session_id: &str, name: &str, data: Value) {
        self.collect(
            DebugEvent::new(DebugEventType::Custom, session_id, data)
                .with_metadata(serde_json::json!({ "name": name })),
        );
    }

    /// Swap the buffer out and return its events (oldest first)
    pub fn flush(&self) -> Vec<DebugEvent> {
        self.flush_with(FlushTrigger::Manual)
    }

    fn flush_with(&self, trigger: FlushTrigger) -> Vec<DebugEvent> {
        let events = {
            let mut state = self.state();
            if state.events.is_empty() {
                return Vec::new();
            }
            Self::swap_out(&mut state)
        };

        crate::metrics::update_buffer_utilization(0.0);
        self.publish_flush(trigger, &events);
        events
    }

    fn swap_out(state: &mut BufferState) -> Vec<DebugEvent> {
        state.flush_count += 1;
        state.last_flush_time = Some(current_millis());
        std::mem::take(&mut state.events).into()
    }

    fn publish_flush(&self, trigger: FlushTrigger, events: &[DebugEvent]) {
        tracing::debug!(trigger = ?trigger, events = events.len(), "Debug event buffer flushed");
        crate::metrics::record_flush(
            match trigger {
                FlushTrigger::Interval => "interval",
                FlushTrigger::HighWaterMark => "high_water_mark",
                FlushTrigger::Manual => "manual",
            },
            events.len(),
        );
        self.bus.publish(DebugNotification::Flushed {
            trigger,
            events: events.to_vec(),
        });
    }

    pub fn len(&self) -> usize {
        self.state().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the buffered events, oldest first
    pub fn snapshot(&self) -> Vec<DebugEvent> {
        self.state().events.iter().cloned().collect()
    }

    pub fn statistics(&self) -> CollectorStatistics {
        let state = self.state();
        let elapsed = self.started_at.elapsed().as_secs_f64().max(1e-3);

        CollectorStatistics {
            total_events: state.total_events,
            events_by_type: state
                .events_by_type
                .iter()
                .map(|(t, n)| (t.as_str().to_string(), *n))
                .collect(),
            events_per_second: state.total_events as f64 / elapsed,
            buffered: state.events.len(),
            capacity: self.config.capacity,
            utilization: state.events.len() as f64 / self.config.capacity as f64,
            dropped_events: state.dropped_events,
            flush_count: state.flush_count,
            last_flush_time: state.last_flush_time,
        }
    }

    /// Start the interval flush timer
    ///
    /// Returns `None` when auto-flush is disabled.
    pub fn start(self: &Arc<Self>) -> Option<BackgroundTask> {
        if !self.config.auto_flush {
            return None;
        }

        let collector = Arc::clone(self);
        let period = self.config.flush_interval();

        Some(BackgroundTask::spawn("collector-flush", move |mut shutdown| async move {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        collector.flush_with(FlushTrigger::Interval);
                    }
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
        }))
    }
}
