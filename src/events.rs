use crate::config::EventsConfig;
use crate::errors::{AppError, AppResult};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const PROJECT_PHASE_ADDED: &str = "project.phase.added";
pub const ROUTE_WORK: &str = "work";

/// State change announced after a unit of work committed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub name: String,
    pub route: String,
    pub correlation_id: String,
    pub entity: Value,
}

impl DomainEvent {
    pub fn new(name: &str, route: &str, correlation_id: &str, entity: Value) -> Self {
        Self {
            name: name.to_string(),
            route: route.to_string(),
            correlation_id: correlation_id.to_string(),
            entity,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn deliver(&self, event: &DomainEvent) -> AppResult<()>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOptions {
    pub correlation_id: String,
}

/// Outbound message bus. Broker adapters implement this.
pub trait MessageBus: Send + Sync {
    fn publish(&self, routing_key: &str, payload: &Value, options: &PublishOptions) -> AppResult<()>;
}

/// Bus used when no broker is configured: messages only reach the log.
#[derive(Debug, Default, Clone)]
pub struct LoggingBus;

impl MessageBus for LoggingBus {
    fn publish(&self, routing_key: &str, payload: &Value, options: &PublishOptions) -> AppResult<()> {
        tracing::info!(
            target: "bus",
            routing_key = %routing_key,
            correlation_id = %options.correlation_id,
            payload = %payload,
            "message published"
        );
        Ok(())
    }
}

pub struct MessageBusSink {
    bus: Arc<dyn MessageBus>,
}

impl MessageBusSink {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }
}

impl EventSink for MessageBusSink {
    fn name(&self) -> &'static str {
        "message-bus"
    }

    fn deliver(&self, event: &DomainEvent) -> AppResult<()> {
        let payload = json!({ "added": event.entity, "route": event.route });
        let options = PublishOptions {
            correlation_id: event.correlation_id.clone(),
        };
        self.bus.publish(&event.name, &payload, &options)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InProcessEvent {
    pub name: String,
    pub correlation_id: String,
    pub payload: Value,
}

/// Broadcasts events to listeners inside this process.
#[derive(Clone)]
pub struct InProcessSink {
    sender: broadcast::Sender<InProcessEvent>,
}

impl InProcessSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InProcessEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for InProcessSink {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn deliver(&self, event: &DomainEvent) -> AppResult<()> {
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        self.sender
            .send(InProcessEvent {
                name: event.name.clone(),
                correlation_id: event.correlation_id.clone(),
                payload: json!({ "created": event.entity }),
            })
            .map(|_| ())
            .map_err(|_| AppError::Internal("in-process event channel closed".to_string()))
    }
}

/// Fans a committed event out to every sink independently. A sink failure
/// is retried, then logged and swallowed unless the route is strict.
pub struct EventPublisher {
    sinks: Vec<Arc<dyn EventSink>>,
    attempts: u32,
    strict_routes: BTreeSet<String>,
}

impl EventPublisher {
    pub fn new(config: &EventsConfig) -> Self {
        Self {
            sinks: Vec::new(),
            attempts: config.publish_attempts.max(1),
            strict_routes: config.strict_routes.clone(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn publish(&self, event: &DomainEvent) -> AppResult<()> {
        let mut failed = Vec::new();
        for sink in &self.sinks {
            tracing::debug!(sink = sink.name(), event = %event.name, correlation_id = %event.correlation_id, "publishing event");
            if let Err(error) = self.deliver_with_retry(sink.as_ref(), event) {
                tracing::warn!(
                    sink = sink.name(),
                    event = %event.name,
                    correlation_id = %event.correlation_id,
                    error = %error,
                    "event publish failed"
                );
                failed.push(sink.name());
            }
        }

        if !failed.is_empty() && self.strict_routes.contains(&event.route) {
            return Err(AppError::Internal(format!(
                "event {} not delivered to {}",
                event.name,
                failed.join(", ")
            )));
        }
        Ok(())
    }

    fn deliver_with_retry(&self, sink: &dyn EventSink, event: &DomainEvent) -> AppResult<()> {
        let mut attempt = 1;
        loop {
            match sink.deliver(event) {
                Ok(()) => return Ok(()),
                Err(error) if attempt >= self.attempts => return Err(error),
                Err(error) => {
                    tracing::debug!(sink = sink.name(), attempt, error = %error, "retrying event publish");
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBus {
        messages: Mutex<Vec<(String, Value, String)>>,
    }

    impl MessageBus for RecordingBus {
        fn publish(&self, routing_key: &str, payload: &Value, options: &PublishOptions) -> AppResult<()> {
            self.messages
                .lock()
                .expect("messages lock")
                .push((routing_key.to_string(), payload.clone(), options.correlation_id.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingBus {
        calls: AtomicU32,
    }

    impl MessageBus for FailingBus {
        fn publish(&self, _: &str, _: &Value, _: &PublishOptions) -> AppResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Io("broker unreachable".to_string()))
        }
    }

    fn event() -> DomainEvent {
        DomainEvent::new(PROJECT_PHASE_ADDED, ROUTE_WORK, "req-9", json!({ "id": 1 }))
    }

    #[test]
    fn bus_sink_wraps_entity_with_route() {
        let bus = Arc::new(RecordingBus::default());
        let publisher = EventPublisher::new(&EventsConfig::default())
            .with_sink(Arc::new(MessageBusSink::new(bus.clone())));
        publisher.publish(&event()).expect("publish");

        let messages = bus.messages.lock().expect("messages lock");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, PROJECT_PHASE_ADDED);
        assert_eq!(messages[0].1, json!({ "added": { "id": 1 }, "route": "work" }));
        assert_eq!(messages[0].2, "req-9");
    }

    #[test]
    fn in_process_sink_broadcasts_created_payload() {
        let sink = InProcessSink::new(4);
        let mut receiver = sink.subscribe();
        let publisher = EventPublisher::new(&EventsConfig::default()).with_sink(Arc::new(sink));
        publisher.publish(&event()).expect("publish");

        let received = receiver.try_recv().expect("event delivered");
        assert_eq!(received.payload, json!({ "created": { "id": 1 } }));
        assert_eq!(received.correlation_id, "req-9");
    }

    #[test]
    fn failures_are_retried_then_swallowed() {
        let bus = Arc::new(FailingBus::default());
        let config = EventsConfig {
            publish_attempts: 3,
            ..EventsConfig::default()
        };
        let publisher = EventPublisher::new(&config).with_sink(Arc::new(MessageBusSink::new(bus.clone())));
        assert!(publisher.publish(&event()).is_ok());
        assert_eq!(bus.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn strict_route_surfaces_failure_after_other_sinks_ran() {
        let mut config = EventsConfig::default();
        config.strict_routes.insert(ROUTE_WORK.to_string());
        let in_process = InProcessSink::new(4);
        let mut receiver = in_process.subscribe();
        let publisher = EventPublisher::new(&config)
            .with_sink(Arc::new(MessageBusSink::new(Arc::new(FailingBus::default()))))
            .with_sink(Arc::new(in_process));

        assert!(matches!(publisher.publish(&event()), Err(AppError::Internal(_))));
        assert!(receiver.try_recv().is_ok());
    }
}
