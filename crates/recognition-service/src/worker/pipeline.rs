//! One recognition tick: detect, match, score, persist (rate-limited) and publish.

use super::{WorkerDeps, WorkerShared};
use crate::hub::FanoutHub;
use crate::matching::Matcher;
use crate::media::{self, MediaStore};
use crate::quality::{self, QualityThreshold};
use crate::recognizer::{Face, Recognizer};
use crate::source::Frame;
use crate::store::EventStore;
use common::cameras::CameraConfig;
use common::events::{classify, LiveEvent, NewDetectionEvent};
use image::DynamicImage;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// What a single tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub faces: usize,
    pub persisted: usize,
    pub published: usize,
}

pub struct RecognitionPipeline {
    config: CameraConfig,
    matcher: Matcher,
    recognizer: Arc<dyn Recognizer>,
    events: Arc<dyn EventStore>,
    media: MediaStore,
    quality: Arc<QualityThreshold>,
    hub: Arc<FanoutHub>,
    shared: Arc<WorkerShared>,
    cooldown_ms: i64,
    /// Timestamp of the last persistence attempt
    last_persisted_ms: Option<i64>,
}

impl RecognitionPipeline {
    pub fn new(
        config: CameraConfig,
        matcher: Matcher,
        deps: &WorkerDeps,
        hub: Arc<FanoutHub>,
        shared: Arc<WorkerShared>,
    ) -> Self {
        Self {
            config,
            matcher,
            recognizer: deps.recognizer.clone(),
            events: deps.events.clone(),
            media: deps.media.clone(),
            quality: deps.quality.clone(),
            hub,
            shared,
            cooldown_ms: deps.settings.cooldown.as_millis() as i64,
            last_persisted_ms: None,
        }
    }

    fn cooldown_elapsed(&self, now_ms: i64) -> bool {
        match self.last_persisted_ms {
            Some(last) => now_ms - last >= self.cooldown_ms,
            None => true,
        }
    }

    pub async fn tick(&mut self, frame: &Frame, now_ms: i64) -> TickReport {
        let camera_id = self.config.id.clone();
        let started = Instant::now();
        let detected = self.recognizer.detect(&frame.image).await;
        telemetry::metrics::RECOGNITION_LATENCY
            .with_label_values(&[self.recognizer.name()])
            .observe(started.elapsed().as_secs_f64());

        let faces = match detected {
            Ok(faces) => faces,
            Err(e) => {
                telemetry::metrics::RECOGNITION_ERRORS
                    .with_label_values(&[camera_id.as_str()])
                    .inc();
                warn!(camera_id = %camera_id, frame_seq = frame.seq, error = %e, "recognition failed");
                self.shared.record_error(format!("recognize: {:#}", e));
                Vec::new()
            }
        };

        let mut report = TickReport {
            faces: faces.len(),
            ..Default::default()
        };
        let mut best_similarity: Option<f32> = None;
        let mut matches = 0u64;

        for (index, face) in faces.iter().enumerate() {
            let event = self.build_event(frame, face, now_ms);
            best_similarity = Some(best_similarity.map_or(event.confidence, |b| b.max(event.confidence)));
            if event.matched {
                matches += 1;
            }
            telemetry::metrics::FACES_DETECTED
                .with_label_values(&[camera_id.as_str(), if event.matched { "true" } else { "false" }])
                .inc();

            let persisted_id = if self.cooldown_elapsed(now_ms) {
                self.last_persisted_ms = Some(now_ms);
                self.persist(event.clone(), &frame.image, index).await
            } else {
                telemetry::metrics::EVENTS_SUPPRESSED
                    .with_label_values(&[camera_id.as_str()])
                    .inc();
                None
            };
            if persisted_id.is_some() {
                report.persisted += 1;
            }

            self.hub.publish(LiveEvent::from_event(&event, persisted_id));
            report.published += 1;
        }

        self.shared.record_tick(best_similarity, matches, now_ms);
        if report.faces > 0 {
            debug!(
                camera_id = %camera_id,
                frame_seq = frame.seq,
                faces = report.faces,
                persisted = report.persisted,
                best_similarity = best_similarity.unwrap_or_default(),
                "recognition tick"
            );
        }
        report
    }

    fn build_event(&self, frame: &Frame, face: &Face, now_ms: i64) -> NewDetectionEvent {
        let outcome = self.matcher.best_match(&face.embedding);
        let matched = outcome.similarity >= self.config.threshold;
        let (event_type, alert_level) = classify(matched, outcome.similarity);

        let crop = media::crop_face(&frame.image, &face.bbox, 0);
        let quality_score = quality::face_quality(crop.as_ref());

        NewDetectionEvent {
            camera_id: self.config.id.clone(),
            ts: now_ms,
            confidence: outcome.similarity,
            bbox: face.bbox,
            thumb_relpath: None,
            matched,
            person_id: outcome.person_id.filter(|_| matched),
            person_name: outcome.person_name.filter(|_| matched),
            quality_score,
            is_low_quality: self.quality.is_low(quality_score),
            full_image_path: None,
            face_size: face.bbox.face_size(),
            alert_level,
            event_type,
            detection_score: face.detection_score,
            extra: json!({
                "frame_seq": frame.seq,
                "recognizer": self.recognizer.name(),
                "mode": self.config.mode.as_str(),
            }),
        }
    }

    /// Save the event's images and insert it; `None` if the insert failed
    async fn persist(&self, mut event: NewDetectionEvent, image: &Arc<DynamicImage>, index: usize) -> Option<i64> {
        let camera_id = event.camera_id.clone();
        let image = image.clone();
        let bbox = event.bbox;
        let matched = event.matched;
        let encoded = tokio::task::spawn_blocking(move || {
            let thumb = media::thumbnail_jpeg(&image, &bbox);
            let full = matched.then(|| media::full_frame_jpeg(&image, &bbox));
            (thumb, full)
        })
        .await;

        match encoded {
            Ok((thumb, full)) => {
                match thumb {
                    Ok(Some(jpeg)) => match self.media.save_thumbnail(&camera_id, event.ts, index, &jpeg).await {
                        Ok(path) => event.thumb_relpath = Some(path),
                        Err(e) => warn!(camera_id = %camera_id, error = %e, "failed to save thumbnail"),
                    },
                    Ok(None) => debug!(camera_id = %camera_id, "face box outside frame, no thumbnail"),
                    Err(e) => warn!(camera_id = %camera_id, error = %e, "failed to encode thumbnail"),
                }
                match full {
                    Some(Ok(jpeg)) => match self.media.save_frame(&camera_id, event.ts, index, &jpeg).await {
                        Ok(path) => event.full_image_path = Some(path),
                        Err(e) => warn!(camera_id = %camera_id, error = %e, "failed to save full frame"),
                    },
                    Some(Err(e)) => warn!(camera_id = %camera_id, error = %e, "failed to encode full frame"),
                    None => {}
                }
            }
            Err(e) => warn!(camera_id = %camera_id, error = %e, "media encoding task failed"),
        }

        match self.events.insert(&event).await {
            Ok(id) => {
                telemetry::metrics::EVENTS_PERSISTED
                    .with_label_values(&[camera_id.as_str()])
                    .inc();
                Some(id)
            }
            Err(e) => {
                telemetry::metrics::EVENT_STORE_ERRORS.inc();
                error!(camera_id = %camera_id, error = %e, "failed to persist detection event");
                self.shared.record_error(format!("persist: {:#}", e));
                None
            }
        }
    }
}
