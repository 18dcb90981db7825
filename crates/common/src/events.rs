//! Detection event contracts: the persisted record, the live fan-out payload
//! and the filtered query used to page through history.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Similarity at or above which a match is raised to a medium alert
pub const MEDIUM_ALERT_SIMILARITY: f32 = 0.8;

#[derive(Debug, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Face bounding box in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y2 - self.y1).max(0)
    }

    /// Smallest side, stored as the event's face size
    pub fn face_size(&self) -> i32 {
        self.width().min(self.height())
    }

    pub fn to_array(self) -> [i32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Recognized,
    Unknown,
}

macro_rules! str_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(ParseEnumError::new($kind, other)),
                }
            }
        }
    };
}

str_enum!(AlertLevel, "alert level", {
    Info => "info",
    Low => "low",
    Medium => "medium",
    High => "high",
});

str_enum!(EventType, "event type", {
    Recognized => "recognized",
    Unknown => "unknown",
});

/// Map a match decision to its event type and alert level
pub fn classify(matched: bool, similarity: f32) -> (EventType, AlertLevel) {
    if !matched {
        return (EventType::Unknown, AlertLevel::Info);
    }
    if similarity >= MEDIUM_ALERT_SIMILARITY {
        (EventType::Recognized, AlertLevel::Medium)
    } else {
        (EventType::Recognized, AlertLevel::Low)
    }
}

/// An event before the store has assigned it an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDetectionEvent {
    pub camera_id: String,
    /// Unix ms
    pub ts: i64,
    /// Similarity against the best reference
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub thumb_relpath: Option<String>,
    pub matched: bool,
    pub person_id: Option<String>,
    pub person_name: Option<String>,
    pub quality_score: f32,
    pub is_low_quality: bool,
    pub full_image_path: Option<String>,
    pub face_size: i32,
    pub alert_level: AlertLevel,
    pub event_type: EventType,
    /// Detector confidence for the face box
    pub detection_score: f32,
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl NewDetectionEvent {
    pub fn with_id(self, id: i64) -> DetectionEvent {
        DetectionEvent { id, event: self }
    }
}

/// A persisted, immutable detection event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: i64,
    #[serde(flatten)]
    pub event: NewDetectionEvent,
}

/// Payload delivered to live subscribers on every recognition tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub camera_id: String,
    pub ts: i64,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub matched: bool,
    pub person_id: Option<String>,
    pub person_name: Option<String>,
    pub quality_score: f32,
    pub is_low_quality: bool,
    pub event_type: EventType,
    pub alert_level: AlertLevel,
    /// Store id when this face was also persisted
    pub persisted_id: Option<i64>,
}

impl LiveEvent {
    pub fn from_event(event: &NewDetectionEvent, persisted_id: Option<i64>) -> Self {
        Self {
            camera_id: event.camera_id.clone(),
            ts: event.ts,
            confidence: event.confidence,
            bbox: event.bbox,
            matched: event.matched,
            person_id: event.person_id.clone(),
            person_name: event.person_name.clone(),
            quality_score: event.quality_score,
            is_low_quality: event.is_low_quality,
            event_type: event.event_type,
            alert_level: event.alert_level,
            persisted_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortColumn {
    #[default]
    Ts,
    Confidence,
    QualityScore,
    FaceSize,
    CameraId,
}

impl SortColumn {
    /// Column name in the events table
    pub fn column(&self) -> &'static str {
        match self {
            SortColumn::Ts => "ts",
            SortColumn::Confidence => "confidence",
            SortColumn::QualityScore => "quality_score",
            SortColumn::FaceSize => "face_size",
            SortColumn::CameraId => "camera_id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Conjunctive filter over the event log
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQuery {
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    /// Shorthand for `start_ms = now - hours`; ignored when `start_ms` is set
    pub last_hours: Option<f64>,
    pub matched_only: bool,
    pub min_confidence: Option<f32>,
    pub max_confidence: Option<f32>,
    /// Case-insensitive substring of the matched person's name
    pub person_name: Option<String>,
    pub min_quality: Option<f32>,
    pub max_quality: Option<f32>,
    pub exclude_low_quality: bool,
    pub min_face_size: Option<i32>,
    pub camera_ids: Vec<String>,
    pub alert_levels: Vec<AlertLevel>,
    pub event_types: Vec<EventType>,
    pub sort_by: SortColumn,
    pub order: SortOrder,
    /// 1-based page number
    pub page: u32,
    pub limit: u32,
}

impl EventQuery {
    /// Clamp paging to sane values and resolve `last_hours` against `now_ms`
    pub fn normalized(mut self, now_ms: i64) -> Self {
        self.page = self.page.max(1);
        self.limit = match self.limit {
            0 => DEFAULT_PAGE_LIMIT,
            n => n.min(MAX_PAGE_LIMIT),
        };
        if self.start_ms.is_none() {
            if let Some(hours) = self.last_hours.filter(|h| *h > 0.0) {
                self.start_ms = Some(now_ms - (hours * 3_600_000.0) as i64);
            }
        }
        self
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }

    /// Evaluate every predicate against one event
    pub fn matches(&self, event: &NewDetectionEvent) -> bool {
        if self.start_ms.is_some_and(|s| event.ts < s) {
            return false;
        }
        if self.end_ms.is_some_and(|e| event.ts > e) {
            return false;
        }
        if self.matched_only && !event.matched {
            return false;
        }
        if self.min_confidence.is_some_and(|c| event.confidence < c) {
            return false;
        }
        if self.max_confidence.is_some_and(|c| event.confidence > c) {
            return false;
        }
        if let Some(needle) = self.person_name.as_deref().filter(|n| !n.is_empty()) {
            let needle = needle.to_lowercase();
            let hit = event
                .person_name
                .as_deref()
                .is_some_and(|name| name.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        if self.min_quality.is_some_and(|q| event.quality_score < q) {
            return false;
        }
        if self.max_quality.is_some_and(|q| event.quality_score > q) {
            return false;
        }
        if self.exclude_low_quality && event.is_low_quality {
            return false;
        }
        if self.min_face_size.is_some_and(|s| event.face_size < s) {
            return false;
        }
        if !self.camera_ids.is_empty() && !self.camera_ids.contains(&event.camera_id) {
            return false;
        }
        if !self.alert_levels.is_empty() && !self.alert_levels.contains(&event.alert_level) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        true
    }
}

/// One page of query results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<DetectionEvent>,
    pub total_count: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl EventPage {
    pub fn new(events: Vec<DetectionEvent>, total_count: u64, query: &EventQuery) -> Self {
        let limit = u64::from(query.limit.max(1));
        let total_pages = total_count.div_ceil(limit);
        Self {
            events,
            total_count,
            page: query.page,
            limit: query.limit,
            total_pages,
            has_next: u64::from(query.page) < total_pages,
            has_prev: query.page > 1,
        }
    }
}

/// Aggregate counts over the whole log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub total: u64,
    pub matched: u64,
    pub low_quality: u64,
    pub average_quality: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(camera: &str, ts: i64, confidence: f32, matched: bool) -> NewDetectionEvent {
        let (event_type, alert_level) = classify(matched, confidence);
        NewDetectionEvent {
            camera_id: camera.to_string(),
            ts,
            confidence,
            bbox: BoundingBox::new(10, 10, 90, 110),
            thumb_relpath: None,
            matched,
            person_id: matched.then(|| "p1".to_string()),
            person_name: matched.then(|| "Alice Smith".to_string()),
            quality_score: 0.7,
            is_low_quality: false,
            full_image_path: None,
            face_size: 80,
            alert_level,
            event_type,
            detection_score: 0.99,
            extra: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(true, 0.85), (EventType::Recognized, AlertLevel::Medium));
        assert_eq!(classify(true, 0.65), (EventType::Recognized, AlertLevel::Low));
        assert_eq!(classify(false, 0.95), (EventType::Unknown, AlertLevel::Info));
    }

    #[test]
    fn test_bbox_face_size() {
        let bbox = BoundingBox::new(10, 20, 60, 100);
        assert_eq!(bbox.width(), 50);
        assert_eq!(bbox.height(), 80);
        assert_eq!(bbox.face_size(), 50);
        assert_eq!(BoundingBox::new(50, 50, 10, 10).face_size(), 0);
    }

    #[test]
    fn test_query_predicates_compose() {
        let query = EventQuery {
            matched_only: true,
            min_confidence: Some(0.7),
            person_name: Some("alice".to_string()),
            camera_ids: vec!["cam-1".to_string()],
            ..Default::default()
        };

        assert!(query.matches(&event("cam-1", 1, 0.9, true)));
        assert!(!query.matches(&event("cam-2", 1, 0.9, true)));
        assert!(!query.matches(&event("cam-1", 1, 0.65, true)));
        assert!(!query.matches(&event("cam-1", 1, 0.9, false)));
    }

    #[test]
    fn test_query_normalization() {
        let query = EventQuery {
            last_hours: Some(2.0),
            limit: 5000,
            ..Default::default()
        }
        .normalized(10_000_000);

        assert_eq!(query.page, 1);
        assert_eq!(query.limit, MAX_PAGE_LIMIT);
        assert_eq!(query.start_ms, Some(10_000_000 - 7_200_000));
        assert_eq!(query.offset(), 0);
    }

    #[test]
    fn test_page_math() {
        let query = EventQuery {
            page: 2,
            limit: 10,
            ..Default::default()
        };
        let page = EventPage::new(vec![], 25, &query);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_next);
        assert!(page.has_prev);

        let last = EventPage::new(vec![], 20, &query);
        assert_eq!(last.total_pages, 2);
        assert!(!last.has_next);
    }

    #[test]
    fn test_enum_round_trip_strings() {
        assert_eq!("medium".parse::<AlertLevel>().unwrap(), AlertLevel::Medium);
        assert_eq!(EventType::Unknown.to_string(), "unknown");
        assert!("critical".parse::<AlertLevel>().is_err());
    }
}
