use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use lazy_static::lazy_static;

lazy_static! {
    // HTTP metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bean_http_requests_total", "Total HTTP requests"),
        &["method", "status"]
    ).expect("metric can be created");

    // Ledger metrics
    pub static ref TRANSFERS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bean_transfers_total", "Transfers by outcome"),
        &["outcome"]
    ).expect("metric can be created");

    pub static ref BEANS_MINTED: IntCounterVec = IntCounterVec::new(
        Opts::new("bean_minted_total", "Beans created, by reason"),
        &["reason"]
    ).expect("metric can be created");

    pub static ref GIFT_LINKS: IntCounterVec = IntCounterVec::new(
        Opts::new("bean_gift_links_total", "Gift link lifecycle events"),
        &["event"]
    ).expect("metric can be created");

    pub static ref HARVESTS_COMPLETED: IntCounter = IntCounter::new(
        "bean_harvests_completed_total",
        "Harvests completed and paid out"
    ).expect("metric can be created");

    pub static ref TOKENS_ISSUED: IntCounter = IntCounter::new(
        "bean_api_tokens_issued_total",
        "API tokens issued"
    ).expect("metric can be created");
}

/// Register all metrics with the given registry
pub fn register_metrics(registry: &Registry) -> Result<(), Box<dyn std::error::Error>> {
    registry.register(Box::new(HTTP_REQUESTS_TOTAL.clone()))?;
    registry.register(Box::new(TRANSFERS_TOTAL.clone()))?;
    registry.register(Box::new(BEANS_MINTED.clone()))?;
    registry.register(Box::new(GIFT_LINKS.clone()))?;
    registry.register(Box::new(HARVESTS_COMPLETED.clone()))?;
    registry.register(Box::new(TOKENS_ISSUED.clone()))?;
    Ok(())
}

/// Generate metrics output in Prometheus text format
pub fn metrics_handler() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Status class label (`2xx`, `4xx`, ...)
pub fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

pub fn record_transfer(outcome: &str) {
    TRANSFERS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_mint(reason: &str, beans: i64) {
    if beans > 0 {
        BEANS_MINTED.with_label_values(&[reason]).inc_by(beans as u64);
    }
}

pub fn record_gift_link(event: &str) {
    GIFT_LINKS.with_label_values(&[event]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let registry = Registry::new();
        let result = register_metrics(&registry);
        assert!(result.is_ok());
    }

    #[test]
    fn test_metrics_handler() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();
        HARVESTS_COMPLETED.inc();

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "bean_harvests_completed_total"));
        assert!(metrics_handler().is_ok());
    }

    #[test]
    fn test_record_mint_by_reason() {
        let signups = BEANS_MINTED.with_label_values(&["signup"]).get();
        record_mint("signup", 1);
        record_mint("signup", 0);
        assert!(BEANS_MINTED.with_label_values(&["signup"]).get() >= signups + 1);
    }

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(200), "2xx");
        assert_eq!(status_class(404), "4xx");
        assert_eq!(status_class(503), "5xx");
    }
}
