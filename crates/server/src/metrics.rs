use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};

const COPY_FILE_RESULTS: [&str; 7] = [
    "ok",
    "unauthorized",
    "invalid-source-file-name",
    "invalid-target-file-name",
    "source-file-doesnt-exist",
    "target-file-already-exists",
    "internal-error",
];
const KNOWN_ROUTES: [&str; 4] = ["/", "/healthz", "/metrics", "/copyFile"];
static GLOBAL_METRICS: OnceLock<Arc<HubMetrics>> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

/// Duration samples recorded as a sum/count pair.
#[derive(Debug, Default)]
struct DurationSummary {
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl DurationSummary {
    fn observe(&self, elapsed: Duration) {
        self.sum_ms.fetch_add(elapsed.as_millis() as u64, Ordering::SeqCst);
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Process-wide counters for the session hub. Recording never blocks on
/// anything but a short map lock, so callers fire and forget.
pub struct HubMetrics {
    ws_connections_total: AtomicU64,
    active_connections: AtomicI64,
    active_sessions: AtomicI64,
    doc_load: DurationSummary,
    doc_store: DurationSummary,
    drain_persist: DurationSummary,
    doc_size_bytes: AtomicU64,
    saves_total: AtomicU64,
    save_skipped_total: AtomicU64,
    save_failed_total: AtomicU64,
    frame_errors_total: AtomicU64,
    copy_file_total: Mutex<HashMap<String, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
}

impl Default for HubMetrics {
    fn default() -> Self {
        let mut copy_file_total = HashMap::new();
        for result in COPY_FILE_RESULTS {
            copy_file_total.insert(result.to_string(), 0);
        }

        Self {
            ws_connections_total: AtomicU64::new(0),
            active_connections: AtomicI64::new(0),
            active_sessions: AtomicI64::new(0),
            doc_load: DurationSummary::default(),
            doc_store: DurationSummary::default(),
            drain_persist: DurationSummary::default(),
            doc_size_bytes: AtomicU64::new(0),
            saves_total: AtomicU64::new(0),
            save_skipped_total: AtomicU64::new(0),
            save_failed_total: AtomicU64::new(0),
            frame_errors_total: AtomicU64::new(0),
            copy_file_total: Mutex::new(copy_file_total),
            request_rate_total: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<HubMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<HubMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_opened();
    }
}

pub fn connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_closed();
    }
}

pub fn set_active_sessions(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_active_sessions(count);
    }
}

pub fn observe_doc_load(elapsed: Duration) {
    if let Some(metrics) = global_metrics() {
        metrics.doc_load.observe(elapsed);
    }
}

pub fn observe_doc_store(elapsed: Duration) {
    if let Some(metrics) = global_metrics() {
        metrics.observe_doc_store(elapsed);
    }
}

pub fn observe_drain_persist(elapsed: Duration, doc_size_bytes: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.observe_drain_persist(elapsed, doc_size_bytes);
    }
}

pub fn increment_save_skipped() {
    if let Some(metrics) = global_metrics() {
        metrics.save_skipped_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_save_failed() {
    if let Some(metrics) = global_metrics() {
        metrics.save_failed_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_frame_errors() {
    if let Some(metrics) = global_metrics() {
        metrics.frame_errors_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn record_http_request(method: &str, path: &str, status_code: u16) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code);
    }
}

impl HubMetrics {
    pub fn connection_opened(&self) {
        self.ws_connections_total.fetch_add(1, Ordering::SeqCst);
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.store(count as i64, Ordering::SeqCst);
    }

    pub fn observe_doc_store(&self, elapsed: Duration) {
        self.doc_store.observe(elapsed);
        self.saves_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn observe_drain_persist(&self, elapsed: Duration, doc_size_bytes: usize) {
        self.drain_persist.observe(elapsed);
        self.doc_size_bytes.store(doc_size_bytes as u64, Ordering::SeqCst);
    }

    pub fn increment_copy_file(&self, result: &str) {
        let label = if COPY_FILE_RESULTS.contains(&result) { result } else { "unknown" };
        increment_label_counter(&self.copy_file_total, &label.to_string());
    }

    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_label_counter(&self.request_rate_total, &key);
        if status_code >= 400 {
            increment_label_counter(&self.request_errors_total, &key);
        }
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        append_scalar(
            &mut output,
            "docsync_ws_connections_total",
            "counter",
            "Total websocket connections accepted.",
            self.ws_connections_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "docsync_active_connections",
            "gauge",
            "Websocket connections currently attached to a document.",
            self.active_connections.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "docsync_active_sessions",
            "gauge",
            "Documents currently live in memory.",
            self.active_sessions.load(Ordering::SeqCst),
        );
        append_summary(&mut output, "docsync_doc_load_ms", "document load", &self.doc_load);
        append_summary(&mut output, "docsync_doc_store_ms", "document store", &self.doc_store);
        append_summary(
            &mut output,
            "docsync_drain_persist_ms",
            "final flush on session drain",
            &self.drain_persist,
        );
        append_scalar(
            &mut output,
            "docsync_doc_size_bytes",
            "gauge",
            "Encoded size of the most recently drained document.",
            self.doc_size_bytes.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "docsync_saves_total",
            "counter",
            "Successful document saves.",
            self.saves_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "docsync_save_skipped_total",
            "counter",
            "Saves skipped because the document exceeded the size ceiling.",
            self.save_skipped_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "docsync_save_failed_total",
            "counter",
            "Saves rejected by the document store.",
            self.save_failed_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "docsync_frame_errors_total",
            "counter",
            "Inbound frames that failed to decode or apply.",
            self.frame_errors_total.load(Ordering::SeqCst),
        );

        output.push_str("# HELP docsync_copy_file_total File copy requests by result.\n");
        output.push_str("# TYPE docsync_copy_file_total counter\n");
        append_label_lines(&mut output, "docsync_copy_file_total", "result", &self.copy_file_total);

        output.push_str("# HELP docsync_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE docsync_request_rate_total counter\n");
        append_endpoint_lines(&mut output, "docsync_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP docsync_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE docsync_request_errors_total counter\n");
        append_endpoint_lines(
            &mut output,
            "docsync_request_errors_total",
            &self.request_errors_total,
        );

        output
    }
}

/// Document names would explode label cardinality, so every path outside the
/// fixed routes collapses to `/{doc}`.
pub(crate) fn normalize_endpoint(path: &str) -> String {
    if KNOWN_ROUTES.contains(&path) {
        path.to_string()
    } else {
        "/{doc}".to_string()
    }
}

fn increment_label_counter<K>(map: &Mutex<HashMap<K, u64>>, key: &K)
where
    K: Clone + Eq + std::hash::Hash,
{
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(1);
}

fn append_scalar(
    output: &mut String,
    metric_name: &str,
    kind: &str,
    help: &str,
    value: impl std::fmt::Display,
) {
    output.push_str(&format!("# HELP {metric_name} {help}\n"));
    output.push_str(&format!("# TYPE {metric_name} {kind}\n"));
    output.push_str(&format!("{metric_name} {value}\n"));
}

fn append_summary(output: &mut String, metric_name: &str, what: &str, summary: &DurationSummary) {
    output.push_str(&format!(
        "# HELP {metric_name}_sum Sum of {what} latency in milliseconds.\n"
    ));
    output.push_str(&format!("# TYPE {metric_name}_sum counter\n"));
    output.push_str(&format!("{metric_name}_sum {}\n", summary.sum_ms.load(Ordering::SeqCst)));
    output.push_str(&format!(
        "# HELP {metric_name}_count Count of {what} latency samples.\n"
    ));
    output.push_str(&format!("# TYPE {metric_name}_count counter\n"));
    output.push_str(&format!("{metric_name}_count {}\n", summary.count.load(Ordering::SeqCst)));
}

fn append_label_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn append_endpoint_lines(
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

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
