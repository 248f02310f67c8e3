//! Fire-and-forget counters for the regional metrics endpoint.
//!
//! Each datapoint is posted as a single line-protocol measurement from a
//! detached task; a failed post is logged and forgotten. With no endpoint
//! configured every call is a no-op.

use std::sync::Arc;

use tracing::debug;

use iaas::state::{Operation, ResourceKind};
use settings::Settings;

struct Sink {
    http: reqwest::Client,
    write_url: String,
    region: String,
}

#[derive(Clone)]
pub struct Metrics {
    sink: Option<Arc<Sink>>,
}

impl Metrics {
    pub fn new(settings: &Settings) -> Self {
        if settings.metrics_endpoint.is_empty() {
            return Self { sink: None };
        }
        let sink = Sink {
            http: reqwest::Client::new(),
            write_url: format!(
                "https://{}/write?db={}",
                settings.metrics_endpoint, settings.metrics_database
            ),
            region: settings.region_name.clone(),
        };
        Self { sink: Some(Arc::new(sink)) }
    }

    /// Measurement name for one lifecycle outcome, e.g. `vm_build_success`.
    pub fn measurement(kind: ResourceKind, op: Operation, success: bool) -> String {
        let outcome = if success { "success" } else { "failure" };
        format!("{kind}_{op}_{outcome}")
    }

    pub fn op_result(&self, kind: ResourceKind, op: Operation, success: bool) {
        self.post(Self::measurement(kind, op, success), 1);
    }

    /// Seconds from API request to a running VM.
    pub fn vm_time_to_build(&self, seconds: i64) {
        self.post("vm_time_to_build".to_string(), seconds);
    }

    /// Emitted once per poll pass so the region can alert on a dead agent.
    pub fn heartbeat(&self) {
        self.post("heartbeat".to_string(), 1);
    }

    fn post(&self, measurement: String, value: i64) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        tokio::spawn(async move {
            let line = format!("{measurement},region={} value={value}", sink.region);
            if let Err(err) = sink.http.post(&sink.write_url).body(line).send().await {
                debug!(measurement, error = %err, "metrics post failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measurement_names_match_the_dashboard() {
        assert_eq!(
            Metrics::measurement(ResourceKind::Vm, Operation::Build, true),
            "vm_build_success"
        );
        assert_eq!(
            Metrics::measurement(ResourceKind::VirtualRouter, Operation::Scrub, false),
            "virtual_router_scrub_failure"
        );
        assert_eq!(
            Metrics::measurement(ResourceKind::Backup, Operation::Update, true),
            "backup_update_success"
        );
    }

    #[tokio::test]
    async fn disabled_metrics_are_a_no_op() {
        let metrics = Metrics::new(&Settings::default());
        metrics.heartbeat();
        metrics.op_result(ResourceKind::Vm, Operation::Build, true);
        metrics.vm_time_to_build(120);
    }
}
