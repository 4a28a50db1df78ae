use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative delivery counters. Recording is a no-op when metrics are
/// disabled; entity gauges are always computed.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    enabled: bool,
    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    acknowledged: AtomicU64,
    expired: AtomicU64,
    dead_lettered: AtomicU64,
    handler_faults: AtomicU64,
    requests_timed_out: AtomicU64,
}

/// Counters that only ever grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Sent,
    Delivered,
    Failed,
    Retried,
    Acknowledged,
    Expired,
    DeadLettered,
    HandlerFaults,
    RequestsTimedOut,
}

impl MetricsCollector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Sent => &self.sent,
            Counter::Delivered => &self.delivered,
            Counter::Failed => &self.failed,
            Counter::Retried => &self.retried,
            Counter::Acknowledged => &self.acknowledged,
            Counter::Expired => &self.expired,
            Counter::DeadLettered => &self.dead_lettered,
            Counter::HandlerFaults => &self.handler_faults,
            Counter::RequestsTimedOut => &self.requests_timed_out,
        }
    }

    pub fn record(&self, counter: Counter) {
        self.record_n(counter, 1);
    }

    pub fn record_n(&self, counter: Counter, n: u64) {
        if self.enabled && n > 0 {
            self.slot(counter).fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    /// Combine the counters with point-in-time entity gauges.
    pub fn snapshot(&self, gauges: EntityGauges) -> MetricsSnapshot {
        MetricsSnapshot {
            channels: gauges.channels,
            queues: gauges.queues,
            subscriptions: gauges.subscriptions,
            pending_requests: gauges.pending_requests,
            agents: gauges.agents,
            pending_acks: gauges.pending_acks,
            queued_messages: gauges.queued_messages,
            inbox_messages: gauges.inbox_messages,
            retained_messages: gauges.retained_messages,
            dead_letters: gauges.dead_letters,
            messages_sent: self.get(Counter::Sent),
            messages_delivered: self.get(Counter::Delivered),
            messages_failed: self.get(Counter::Failed),
            messages_retried: self.get(Counter::Retried),
            messages_acknowledged: self.get(Counter::Acknowledged),
            messages_expired: self.get(Counter::Expired),
            messages_dead_lettered: self.get(Counter::DeadLettered),
            handler_faults: self.get(Counter::HandlerFaults),
            requests_timed_out: self.get(Counter::RequestsTimedOut),
        }
    }
}

/// Live entity counts read from the registries at snapshot time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityGauges {
    pub channels: usize,
    pub queues: usize,
    pub subscriptions: usize,
    pub pending_requests: usize,
    pub agents: usize,
    pub pending_acks: usize,
    pub queued_messages: usize,
    pub inbox_messages: usize,
    pub retained_messages: usize,
    pub dead_letters: usize,
}

/// Read-only, point-in-time view of the communication layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub channels: usize,
    pub queues: usize,
    /// Type subscriptions plus queue consumers.
    pub subscriptions: usize,
    pub pending_requests: usize,
    pub agents: usize,
    pub pending_acks: usize,
    pub queued_messages: usize,
    pub inbox_messages: usize,
    pub retained_messages: usize,
    pub dead_letters: usize,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_failed: u64,
    pub messages_retried: u64,
    pub messages_acknowledged: u64,
    pub messages_expired: u64,
    pub messages_dead_lettered: u64,
    pub handler_faults: u64,
    pub requests_timed_out: u64,
}

impl MetricsSnapshot {
    fn gauges(&self) -> [(&'static str, &'static str, usize); 10] {
        [
            ("swarmlink_channels", "Registered channels", self.channels),
            ("swarmlink_queues", "Registered queues", self.queues),
            ("swarmlink_subscriptions", "Type subscriptions and queue consumers", self.subscriptions),
            ("swarmlink_pending_requests", "Requests awaiting a response", self.pending_requests),
            ("swarmlink_agents", "Known agents", self.agents),
            ("swarmlink_pending_acks", "Deliveries awaiting acknowledgment", self.pending_acks),
            ("swarmlink_queued_messages", "Messages buffered in queues", self.queued_messages),
            ("swarmlink_inbox_messages", "Messages waiting in agent inboxes", self.inbox_messages),
            ("swarmlink_retained_messages", "Messages held by the retention store", self.retained_messages),
            ("swarmlink_dead_letters", "Dead-letter entries currently retained", self.dead_letters),
        ]
    }

    fn counters(&self) -> [(&'static str, &'static str, u64); 9] {
        [
            ("swarmlink_messages_sent_total", "Messages admitted", self.messages_sent),
            ("swarmlink_messages_delivered_total", "Successful deliveries", self.messages_delivered),
            ("swarmlink_messages_failed_total", "Deliveries that exhausted retries", self.messages_failed),
            ("swarmlink_messages_retried_total", "Redelivery attempts", self.messages_retried),
            ("swarmlink_messages_acknowledged_total", "Acknowledged deliveries", self.messages_acknowledged),
            ("swarmlink_messages_expired_total", "Messages dropped after their TTL", self.messages_expired),
            ("swarmlink_messages_dead_lettered_total", "Dead-letter entries recorded", self.messages_dead_lettered),
            ("swarmlink_handler_faults_total", "Handler errors and panics", self.handler_faults),
            ("swarmlink_requests_timed_out_total", "Requests that timed out", self.requests_timed_out),
        ]
    }

    /// Render the snapshot in Prometheus text exposition format.
    #[cfg(feature = "observability-prometheus")]
    pub fn render_prometheus(&self) -> anyhow::Result<String> {
        use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

        let registry = Registry::new();
        for (name, help, value) in self.gauges() {
            let gauge = IntGauge::new(name, help)?;
            gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
            registry.register(Box::new(gauge))?;
        }
        for (name, help, value) in self.counters() {
            let counter = IntCounter::new(name, help)?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Plain `name value` lines, used when the Prometheus encoder is compiled out.
    pub fn render_plain(&self) -> String {
        let mut out = String::new();
        for (name, _, value) in self.gauges() {
            out.push_str(&format!("{name} {value}\n"));
        }
        for (name, _, value) in self.counters() {
            out.push_str(&format!("{name} {value}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_collector_keeps_counters_at_zero() {
        let metrics = MetricsCollector::new(false);
        metrics.record(Counter::Sent);
        metrics.record_n(Counter::Delivered, 5);
        let snapshot = metrics.snapshot(EntityGauges {
            channels: 3,
            ..EntityGauges::default()
        });
        assert_eq!(snapshot.messages_sent, 0);
        assert_eq!(snapshot.messages_delivered, 0);
        assert_eq!(snapshot.channels, 3, "gauges are always reported");
    }

    #[test]
    fn enabled_collector_accumulates() {
        let metrics = MetricsCollector::new(true);
        metrics.record(Counter::Sent);
        metrics.record(Counter::Sent);
        metrics.record_n(Counter::Retried, 3);
        let snapshot = metrics.snapshot(EntityGauges::default());
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.messages_retried, 3);
    }

    #[test]
    fn plain_rendering_lists_every_series() {
        let snapshot = MetricsSnapshot {
            queues: 2,
            messages_sent: 7,
            ..MetricsSnapshot::default()
        };
        let text = snapshot.render_plain();
        assert!(text.contains("swarmlink_queues 2\n"));
        assert!(text.contains("swarmlink_messages_sent_total 7\n"));
        assert_eq!(text.lines().count(), 19);
    }

    #[cfg(feature = "observability-prometheus")]
    #[test]
    fn prometheus_rendering_contains_help_and_values() {
        let snapshot = MetricsSnapshot {
            channels: 3,
            handler_faults: 1,
            ..MetricsSnapshot::default()
        };
        let text = snapshot.render_prometheus().unwrap();
        assert!(text.contains("# HELP swarmlink_channels Registered channels"));
        assert!(text.contains("swarmlink_channels 3"));
        assert!(text.contains("swarmlink_handler_faults_total 1"));
    }
}
