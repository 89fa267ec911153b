//! Lightweight runtime counters, recorded through the `metrics` facade so
//! any exporter the operator wires up (statsd, prometheus-bridge, ...)
//! picks them up without this crate depending on one directly.

use metrics::{counter, gauge};

pub fn record_restart_attempt(service: &str) {
    counter!("wardend_restart_attempts_total", "service" => service.to_string()).increment(1);
}

pub fn record_restart_success(service: &str) {
    counter!("wardend_restart_success_total", "service" => service.to_string()).increment(1);
}

pub fn record_notification_sent() {
    counter!("wardend_notifications_sent_total").increment(1);
}

pub fn record_notification_skipped() {
    counter!("wardend_notifications_skipped_total").increment(1);
}

pub fn record_config_reload() {
    counter!("wardend_config_reloads_total").increment(1);
}

pub fn record_config_reload_failed() {
    counter!("wardend_config_reload_failures_total").increment(1);
}

pub fn record_file_diff(section_count: usize) {
    counter!("wardend_file_diffs_total").increment(1);
    gauge!("wardend_file_diff_sections").set(section_count as f64);
}

pub fn record_monitored_services(count: usize) {
    gauge!("wardend_monitored_services").set(count as f64);
}
