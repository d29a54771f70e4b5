use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub orders_total: IntCounterVec,

    // Histograms
    pub delivery_duration_seconds: HistogramVec,
    pub delivery_attempts: Histogram,

    // Dependency gauges
    pub dep_up: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let orders_total = IntCounterVec::new(
            Opts::new("gateway_orders_total", "Order requests by outcome"),
            // accepted|malformed|invalid|overloaded|closed|failed|deadline_exceeded|error
            &["result"],
        )?;

        let delivery_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_delivery_duration_seconds",
                "Time from enqueue to terminal delivery state",
            ),
            &["result"],
        )?;

        let delivery_attempts = Histogram::with_opts(
            HistogramOpts::new("gateway_delivery_attempts", "Publish attempts per delivery")
                .buckets(vec![1.0, 2.0, 3.0, 5.0, 8.0]),
        )?;

        let dep_up = IntGaugeVec::new(
            Opts::new("gateway_dependency_up", "Dependency up gauge"),
            &["dep"], // broker|ready
        )?;

        registry.register(Box::new(orders_total.clone()))?;
        registry.register(Box::new(delivery_duration_seconds.clone()))?;
        registry.register(Box::new(delivery_attempts.clone()))?;
        registry.register(Box::new(dep_up.clone()))?;

        Ok(Self {
            registry,
            orders_total,
            delivery_duration_seconds,
            delivery_attempts,
            dep_up,
        })
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.orders_total.with_label_values(&["accepted"]).inc();
        metrics.delivery_attempts.observe(2.0);
        metrics.dep_up.with_label_values(&["broker"]).set(1);

        let body = metrics.render().unwrap();
        assert!(body.contains("gateway_orders_total{result=\"accepted\"} 1"));
        assert!(body.contains("gateway_delivery_attempts_count 1"));
        assert!(body.contains("gateway_dependency_up{dep=\"broker\"} 1"));
    }
}
