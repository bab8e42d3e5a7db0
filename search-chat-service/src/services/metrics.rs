//! Prometheus metrics for search-chat-service.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

static INIT_LOCK: Mutex<()> = Mutex::new(());

pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Pipeline
pub static CHAT_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static GENERATION_TOKENS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static TOOL_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static BROKEN_CITATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Search
pub static SEARCH_LATENCY_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static SEARCH_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Credits
pub static CREDIT_DEBITS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static LATE_DEBITS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Register all metrics. Later calls are no-ops.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }
    let registry = Registry::new();

    let chat_requests = IntCounterVec::new(
        Opts::new("chat_requests_total", "Chat requests by terminal outcome"),
        &["outcome"],
    )?;

    // type: input, output
    let tokens = IntCounterVec::new(
        Opts::new("generation_tokens_total", "Tokens reported by the generation engine"),
        &["model", "type"],
    )?;

    let tool_calls = IntCounterVec::new(
        Opts::new("tool_calls_total", "Mid-stream tool invocations"),
        &["tool", "status"],
    )?;

    let broken_citations = IntCounterVec::new(
        Opts::new(
            "broken_citations_total",
            "Malformed citations found after generation",
        ),
        &["kind"],
    )?;

    let search_latency = HistogramVec::new(
        HistogramOpts::new("search_latency_seconds", "Search backend latency in seconds")
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 15.0, 30.0]),
        &["backend"],
    )?;

    let search_errors = IntCounterVec::new(
        Opts::new("search_errors_total", "Search backend failures"),
        &["backend"],
    )?;

    let debits = IntCounterVec::new(
        Opts::new("credit_debits_total", "Credit debit attempts by outcome"),
        &["outcome"],
    )?;

    let late_debits = IntCounterVec::new(
        Opts::new(
            "credit_late_debits_total",
            "Debits that resolved after the request stopped waiting",
        ),
        &["outcome"],
    )?;

    registry.register(Box::new(chat_requests.clone()))?;
    registry.register(Box::new(tokens.clone()))?;
    registry.register(Box::new(tool_calls.clone()))?;
    registry.register(Box::new(broken_citations.clone()))?;
    registry.register(Box::new(search_latency.clone()))?;
    registry.register(Box::new(search_errors.clone()))?;
    registry.register(Box::new(debits.clone()))?;
    registry.register(Box::new(late_debits.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = CHAT_REQUESTS_TOTAL.set(chat_requests);
    let _ = GENERATION_TOKENS_TOTAL.set(tokens);
    let _ = TOOL_CALLS_TOTAL.set(tool_calls);
    let _ = BROKEN_CITATIONS_TOTAL.set(broken_citations);
    let _ = SEARCH_LATENCY_SECONDS.set(search_latency);
    let _ = SEARCH_ERRORS_TOTAL.set(search_errors);
    let _ = CREDIT_DEBITS_TOTAL.set(debits);
    let _ = LATE_DEBITS_TOTAL.set(late_debits);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to convert metrics to UTF-8");
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

pub fn record_chat_request(outcome: &str) {
    if let Some(counter) = CHAT_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_tokens(model: &str, input_tokens: u32, output_tokens: u32) {
    if let Some(counter) = GENERATION_TOKENS_TOTAL.get() {
        counter
            .with_label_values(&[model, "input"])
            .inc_by(input_tokens as u64);
        counter
            .with_label_values(&[model, "output"])
            .inc_by(output_tokens as u64);
    }
}

pub fn record_tool_call(tool: &str, status: &str) {
    if let Some(counter) = TOOL_CALLS_TOTAL.get() {
        counter.with_label_values(&[tool, status]).inc();
    }
}

pub fn record_broken_citations(kind: &str, count: usize) {
    if count == 0 {
        return;
    }
    if let Some(counter) = BROKEN_CITATIONS_TOTAL.get() {
        counter.with_label_values(&[kind]).inc_by(count as u64);
    }
}

pub fn observe_search_latency(backend: &str, duration_secs: f64) {
    if let Some(histogram) = SEARCH_LATENCY_SECONDS.get() {
        histogram.with_label_values(&[backend]).observe(duration_secs);
    }
}

pub fn record_search_error(backend: &str) {
    if let Some(counter) = SEARCH_ERRORS_TOTAL.get() {
        counter.with_label_values(&[backend]).inc();
    }
}

pub fn record_debit(outcome: &str) {
    if let Some(counter) = CREDIT_DEBITS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// A debit that finished after the soft timeout already let the request through.
pub fn record_late_debit(outcome: &str) {
    if let Some(counter) = LATE_DEBITS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}
