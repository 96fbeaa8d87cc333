// Prometheus metrics for the HTTP surface
use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder};

lazy_static! {
    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "coderun_submissions_total",
        "Submissions accepted and enqueued, by resolved language",
        &["language"]
    )
    .expect("submissions counter registers once");
    pub static ref SUBMISSIONS_REJECTED: IntCounterVec = register_int_counter_vec!(
        "coderun_submissions_rejected_total",
        "Submissions rejected before enqueue, by reason",
        &["reason"]
    )
    .expect("rejections counter registers once");
    pub static ref QUEUE_DEPTH: IntGauge =
        register_int_gauge!("coderun_queue_depth", "Jobs waiting in the queue at last scrape")
            .expect("queue depth gauge registers once");
}

/// Text exposition of every registered metric.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
