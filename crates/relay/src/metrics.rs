use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    lock_commands_total: Mutex<HashMap<String, u64>>,
    lock_command_errors_total: Mutex<HashMap<String, u64>>,
    lock_command_duration_ms_sum: Mutex<HashMap<String, u64>>,
    steals_started_total: AtomicU64,
    forced_transfers_total: AtomicU64,
    steal_aborts_total: AtomicU64,
    stale_reclaims_total: AtomicU64,
    active_connections: AtomicU64,
}

const LOCK_COMMAND_KINDS: [&str; 9] = [
    "join",
    "acquire",
    "release",
    "heartbeat",
    "steal_request",
    "steal_deny",
    "steal_cancel",
    "early_release",
    "disconnect",
];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        let mut lock_commands_total = HashMap::new();
        for kind in LOCK_COMMAND_KINDS {
            lock_commands_total.insert(kind.to_string(), 0);
        }

        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            lock_commands_total: Mutex::new(lock_commands_total),
            lock_command_errors_total: Mutex::new(HashMap::new()),
            lock_command_duration_ms_sum: Mutex::new(HashMap::new()),
            steals_started_total: AtomicU64::new(0),
            forced_transfers_total: AtomicU64::new(0),
            steal_aborts_total: AtomicU64::new(0),
            stale_reclaims_total: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_lock_command(kind: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_lock_command(kind, is_error, latency_ms);
    }
}

pub fn increment_steals_started() {
    if let Some(metrics) = global_metrics() {
        metrics.steals_started_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_forced_transfers() {
    if let Some(metrics) = global_metrics() {
        metrics.forced_transfers_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_steal_aborts() {
    if let Some(metrics) = global_metrics() {
        metrics.steal_aborts_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_stale_reclaims(count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.stale_reclaims_total.fetch_add(count, Ordering::SeqCst);
    }
}

pub fn set_active_connections(count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.active_connections.store(count, Ordering::SeqCst);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_lock_command(&self, kind: &str, is_error: bool, latency_ms: u64) {
        let kind = normalize_command_kind(kind);
        increment_label_counter(&self.lock_commands_total, &kind, 1);
        increment_label_counter(&self.lock_command_duration_ms_sum, &kind, latency_ms);
        if is_error {
            increment_label_counter(&self.lock_command_errors_total, &kind, 1);
        }
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP lock_commands_total Total lock commands handled by kind.\n");
        output.push_str("# TYPE lock_commands_total counter\n");
        append_label_counter_lines(&mut output, "lock_commands_total", &self.lock_commands_total);

        output.push_str(
            "# HELP lock_command_errors_total Lock commands that ended in an error by kind.\n",
        );
        output.push_str("# TYPE lock_command_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "lock_command_errors_total",
            &self.lock_command_errors_total,
        );

        output.push_str("# HELP lock_command_duration_ms_sum Sum of lock command latency in milliseconds by kind.\n");
        output.push_str("# TYPE lock_command_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "lock_command_duration_ms_sum",
            &self.lock_command_duration_ms_sum,
        );

        append_scalar(
            &mut output,
            "lock_steals_started_total",
            "Steal countdowns armed.",
            "counter",
            &self.steals_started_total,
        );
        append_scalar(
            &mut output,
            "lock_forced_transfers_total",
            "Locks handed over after countdown and cleanup elapsed.",
            "counter",
            &self.forced_transfers_total,
        );
        append_scalar(
            &mut output,
            "lock_steal_aborts_total",
            "Timed steal steps that failed and were torn down.",
            "counter",
            &self.steal_aborts_total,
        );
        append_scalar(
            &mut output,
            "lock_stale_reclaims_total",
            "Locks reclaimed after heartbeat timeout.",
            "counter",
            &self.stale_reclaims_total,
        );
        append_scalar(
            &mut output,
            "relay_ws_active_connections",
            "WebSocket connections open on this relay.",
            "gauge",
            &self.active_connections,
        );

        output
    }
}

fn append_scalar(output: &mut String, name: &str, help: &str, kind: &str, value: &AtomicU64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} {kind}\n"));
    output.push_str(&format!("{name} {}\n", value.load(Ordering::SeqCst)));
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_command_kind(kind: &str) -> String {
    let normalized = kind.trim().to_ascii_lowercase();
    if LOCK_COMMAND_KINDS.contains(&normalized.as_str()) {
        normalized
    } else {
        "unknown".to_string()
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{kind=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::RelayMetrics;

    #[test]
    fn render_prometheus_includes_http_and_lock_metrics() {
        let metrics = RelayMetrics::default();
        metrics.record_http_request(
            "GET",
            "/v1/documents/00000000-0000-0000-0000-000000000001/lock",
            200,
            4,
        );
        metrics.record_lock_command("acquire", false, 3);
        metrics.record_lock_command("acquire", true, 5);
        metrics.record_lock_command("not-a-command", false, 1);
        metrics.forced_transfers_total.fetch_add(2, Ordering::SeqCst);

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains("endpoint=\"/v1/documents/{uuid}/lock\""));
        assert!(rendered.contains("lock_commands_total{kind=\"acquire\"} 2"));
        assert!(rendered.contains("lock_commands_total{kind=\"release\"} 0"));
        assert!(rendered.contains("lock_commands_total{kind=\"unknown\"} 1"));
        assert!(rendered.contains("lock_command_errors_total{kind=\"acquire\"} 1"));
        assert!(rendered.contains("lock_command_duration_ms_sum{kind=\"acquire\"} 8"));
        assert!(rendered.contains("lock_forced_transfers_total 2"));
        assert!(rendered.contains("lock_steals_started_total 0"));
        assert!(rendered.contains("# TYPE relay_ws_active_connections gauge"));
    }
}
