use crate::collectors::now_unix;
use crate::state::{GpuSnapshot, ServiceStatusSnapshot};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub agent_gpu_utilization_percent: GaugeVec,
    pub agent_gpu_memory_used_bytes: GaugeVec,
    pub agent_gpu_memory_total_bytes: GaugeVec,
    pub agent_gpu_memory_usage_percent: GaugeVec,
    pub agent_gpu_temperature_celsius: GaugeVec,
    pub agent_gpu_power_draw_watts: GaugeVec,
    pub agent_gpu_power_limit_watts: GaugeVec,
    pub agent_gpu_count: Gauge,
    pub agent_gpu_process_count: Gauge,
    pub agent_gpu_process_memory_bytes: GaugeVec,
    pub agent_service_up: GaugeVec,
    pub agent_service_models_loaded: GaugeVec,
    pub agent_services_total: Gauge,
    pub agent_services_up: Gauge,
    pub agent_uptime_seconds: Gauge,
    pub agent_scrape_count_total: Counter,
    pub agent_collect_errors_total: CounterVec,
    pub agent_history_appends_total: CounterVec,
    pub agent_kill_requests_total: CounterVec,
    pub agent_last_collect_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let gpu_labels = &["id", "bus_id", "name"];
        let agent_gpu_utilization_percent = GaugeVec::new(
            opts!("agent_gpu_utilization_percent", "GPU utilization in percent"),
            gpu_labels,
        )?;
        let agent_gpu_memory_used_bytes = GaugeVec::new(
            opts!("agent_gpu_memory_used_bytes", "GPU memory used in bytes"),
            gpu_labels,
        )?;
        let agent_gpu_memory_total_bytes = GaugeVec::new(
            opts!("agent_gpu_memory_total_bytes", "GPU memory total in bytes"),
            gpu_labels,
        )?;
        let agent_gpu_memory_usage_percent = GaugeVec::new(
            opts!(
                "agent_gpu_memory_usage_percent",
                "GPU memory usage in percent (0 when total is unknown)"
            ),
            gpu_labels,
        )?;
        let agent_gpu_temperature_celsius = GaugeVec::new(
            opts!("agent_gpu_temperature_celsius", "GPU temperature in Celsius"),
            gpu_labels,
        )?;
        let agent_gpu_power_draw_watts = GaugeVec::new(
            opts!("agent_gpu_power_draw_watts", "GPU power draw in watts"),
            gpu_labels,
        )?;
        let agent_gpu_power_limit_watts = GaugeVec::new(
            opts!("agent_gpu_power_limit_watts", "GPU power limit in watts"),
            gpu_labels,
        )?;
        let agent_gpu_count =
            Gauge::with_opts(opts!("agent_gpu_count", "Number of detected GPUs"))?;
        let agent_gpu_process_count = Gauge::with_opts(opts!(
            "agent_gpu_process_count",
            "Number of compute processes holding GPU memory"
        ))?;
        let agent_gpu_process_memory_bytes = GaugeVec::new(
            opts!(
                "agent_gpu_process_memory_bytes",
                "GPU memory used by a compute process in bytes"
            ),
            &["bus_id", "pid", "name"],
        )?;
        let agent_service_up = GaugeVec::new(
            opts!(
                "agent_service_up",
                "1 when the endpoint answered its status request, 0 otherwise"
            ),
            &["endpoint", "url"],
        )?;
        let agent_service_models_loaded = GaugeVec::new(
            opts!(
                "agent_service_models_loaded",
                "Models reported as loaded by the endpoint"
            ),
            &["endpoint"],
        )?;
        let agent_services_total = Gauge::with_opts(opts!(
            "agent_services_total",
            "Number of configured service endpoints"
        ))?;
        let agent_services_up = Gauge::with_opts(opts!(
            "agent_services_up",
            "Number of reachable service endpoints"
        ))?;
        let agent_uptime_seconds =
            Gauge::with_opts(opts!("agent_uptime_seconds", "Agent uptime in seconds"))?;
        let agent_scrape_count_total = Counter::with_opts(opts!(
            "agent_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let agent_collect_errors_total = CounterVec::new(
            opts!(
                "agent_collect_errors_total",
                "Collector errors by collector"
            ),
            &["collector"],
        )?;
        let agent_history_appends_total = CounterVec::new(
            opts!(
                "agent_history_appends_total",
                "History appends by result (ok/error)"
            ),
            &["result"],
        )?;
        let agent_kill_requests_total = CounterVec::new(
            opts!(
                "agent_kill_requests_total",
                "Kill requests by kind and result"
            ),
            &["kind", "result"],
        )?;
        let agent_last_collect_timestamp_seconds = Gauge::with_opts(opts!(
            "agent_last_collect_timestamp_seconds",
            "Capture time of the latest GPU snapshot"
        ))?;

        register(&registry, &agent_gpu_utilization_percent)?;
        register(&registry, &agent_gpu_memory_used_bytes)?;
        register(&registry, &agent_gpu_memory_total_bytes)?;
        register(&registry, &agent_gpu_memory_usage_percent)?;
        register(&registry, &agent_gpu_temperature_celsius)?;
        register(&registry, &agent_gpu_power_draw_watts)?;
        register(&registry, &agent_gpu_power_limit_watts)?;
        register(&registry, &agent_gpu_count)?;
        register(&registry, &agent_gpu_process_count)?;
        register(&registry, &agent_gpu_process_memory_bytes)?;
        register(&registry, &agent_service_up)?;
        register(&registry, &agent_service_models_loaded)?;
        register(&registry, &agent_services_total)?;
        register(&registry, &agent_services_up)?;
        register(&registry, &agent_uptime_seconds)?;
        register(&registry, &agent_scrape_count_total)?;
        register(&registry, &agent_collect_errors_total)?;
        register(&registry, &agent_history_appends_total)?;
        register(&registry, &agent_kill_requests_total)?;
        register(&registry, &agent_last_collect_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            agent_gpu_utilization_percent,
            agent_gpu_memory_used_bytes,
            agent_gpu_memory_total_bytes,
            agent_gpu_memory_usage_percent,
            agent_gpu_temperature_celsius,
            agent_gpu_power_draw_watts,
            agent_gpu_power_limit_watts,
            agent_gpu_count,
            agent_gpu_process_count,
            agent_gpu_process_memory_bytes,
            agent_service_up,
            agent_service_models_loaded,
            agent_services_total,
            agent_services_up,
            agent_uptime_seconds,
            agent_scrape_count_total,
            agent_collect_errors_total,
            agent_history_appends_total,
            agent_kill_requests_total,
            agent_last_collect_timestamp_seconds,
        }))
    }

    pub fn started_at_unix(&self) -> i64 {
        self.started_at_unix
    }

    pub fn update_gpu(&self, snapshot: &GpuSnapshot) {
        self.agent_last_collect_timestamp_seconds
            .set(snapshot.timestamp as f64);

        self.agent_gpu_utilization_percent.reset();
        self.agent_gpu_memory_used_bytes.reset();
        self.agent_gpu_memory_total_bytes.reset();
        self.agent_gpu_memory_usage_percent.reset();
        self.agent_gpu_temperature_celsius.reset();
        self.agent_gpu_power_draw_watts.reset();
        self.agent_gpu_power_limit_watts.reset();
        self.agent_gpu_process_memory_bytes.reset();

        self.agent_gpu_count.set(snapshot.gpus.len() as f64);
        for g in &snapshot.gpus {
            let labels: [&str; 3] = [&g.device_id, &g.bus_id, &g.name];
            self.agent_gpu_utilization_percent
                .with_label_values(&labels)
                .set(g.utilization_percent as f64);
            self.agent_gpu_memory_used_bytes
                .with_label_values(&labels)
                .set(g.memory_used_bytes as f64);
            self.agent_gpu_memory_total_bytes
                .with_label_values(&labels)
                .set(g.memory_total_bytes as f64);
            let pct = if g.memory_total_bytes > 0 {
                (g.memory_used_bytes as f64 / g.memory_total_bytes as f64) * 100.0
            } else {
                0.0
            };
            self.agent_gpu_memory_usage_percent
                .with_label_values(&labels)
                .set(pct);
            self.agent_gpu_temperature_celsius
                .with_label_values(&labels)
                .set(g.temperature_celsius as f64);
            self.agent_gpu_power_draw_watts
                .with_label_values(&labels)
                .set(g.power_draw_watts);
            self.agent_gpu_power_limit_watts
                .with_label_values(&labels)
                .set(g.power_limit_watts);
        }

        self.agent_gpu_process_count
            .set(snapshot.processes.len() as f64);
        for p in &snapshot.processes {
            let pid = p.pid.to_string();
            self.agent_gpu_process_memory_bytes
                .with_label_values(&[&p.bus_id, &pid, &p.name])
                .set(p.memory_used_bytes as f64);
        }
    }

    pub fn update_services(&self, snapshot: &ServiceStatusSnapshot) {
        self.agent_service_up.reset();
        self.agent_service_models_loaded.reset();

        let total = snapshot.endpoints.len();
        let up = snapshot.endpoints.iter().filter(|r| r.reachable).count();
        self.agent_services_total.set(total as f64);
        self.agent_services_up.set(up as f64);

        for r in &snapshot.endpoints {
            self.agent_service_up
                .with_label_values(&[&r.endpoint.name, &r.endpoint.url])
                .set(if r.reachable { 1.0 } else { 0.0 });
            let loaded = r
                .payload
                .as_ref()
                .and_then(|p| p.get("models"))
                .and_then(|m| m.as_array())
                .map(|m| m.len())
                .unwrap_or(0);
            self.agent_service_models_loaded
                .with_label_values(&[&r.endpoint.name])
                .set(loaded as f64);
        }
    }

    pub fn inc_scrape_count(&self) {
        self.agent_scrape_count_total.inc();
    }

    pub fn inc_collect_error(&self, collector: &str) {
        self.agent_collect_errors_total
            .with_label_values(&[collector])
            .inc();
    }

    pub fn inc_history_append(&self, ok: bool) {
        self.agent_history_appends_total
            .with_label_values(&[if ok { "ok" } else { "error" }])
            .inc();
    }

    pub fn inc_kill_request(&self, kind: &str, success: bool) {
        self.agent_kill_requests_total
            .with_label_values(&[kind, if success { "ok" } else { "error" }])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.agent_uptime_seconds.set(uptime);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
