// Metric names and label sets below are constants; construction only fails on a typo.
#![allow(clippy::expect_used)]

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Camera Worker Metrics ====
    pub static ref CAMERA_WORKERS_RUNNING: IntGauge = {
        let metric = IntGauge::new("camera_workers_running", "Number of running camera workers")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref CAMERA_FRAMES_READ: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("camera_frames_read_total", "Frames decoded from camera sources"),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref CAMERA_READ_ERRORS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("camera_read_errors_total", "Failed frame reads"),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref CAMERA_CONNECT_FAILURES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("camera_connect_failures_total", "Failed attempts to open a camera source"),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Recognition Metrics ====
    pub static ref RECOGNITION_LATENCY: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new(
                "recognition_latency_seconds",
                "Time spent in the recognizer per tick",
            )
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["recognizer"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FACES_DETECTED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("faces_detected_total", "Faces returned by the recognizer"),
            &["camera_id", "matched"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref RECOGNITION_ERRORS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("recognition_errors_total", "Recognition ticks that failed"),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Event Metrics ====
    pub static ref EVENTS_PERSISTED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("events_persisted_total", "Detection events written to the event store"),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref EVENTS_SUPPRESSED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("events_suppressed_total", "Detections not persisted because of the cooldown"),
            &["camera_id"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref EVENT_STORE_ERRORS: IntCounter = {
        let metric = IntCounter::new("event_store_errors_total", "Failed event inserts")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref LIVE_EVENTS_PUBLISHED: IntCounter = {
        let metric = IntCounter::new("live_events_published_total", "Events published to fan-out hubs")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref SUBSCRIBERS_DROPPED: IntCounter = {
        let metric = IntCounter::new(
            "live_subscribers_dropped_total",
            "Subscribers torn down because their queue was full",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Job Metrics ====
    pub static ref JOBS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("jobs_total", "Analysis jobs by type and final status"),
            &["type", "status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref JOB_DURATION: Histogram = {
        let metric = Histogram::with_opts(
            HistogramOpts::new("job_duration_seconds", "Wall time of analysis jobs")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_metrics_accessible() {
        CAMERA_FRAMES_READ.with_label_values(&["metrics-test"]).inc();
        assert_eq!(CAMERA_FRAMES_READ.with_label_values(&["metrics-test"]).get(), 1);
    }

    #[test]
    fn test_metrics_registered() {
        EVENT_STORE_ERRORS.inc();
        JOBS.with_label_values(&["compare", "done"]).inc();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"event_store_errors_total".to_string()));
        assert!(names.contains(&"jobs_total".to_string()));
    }
}
