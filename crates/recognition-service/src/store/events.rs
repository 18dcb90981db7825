use anyhow::{Context, Result};
use async_trait::async_trait;
use common::events::{
    BoundingBox, DetectionEvent, EventPage, EventQuery, EventSummary, NewDetectionEvent,
    SortColumn, SortOrder,
};
use common::validation::now_millis;
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};
use std::cmp::Ordering;
use tokio::sync::{Mutex, RwLock};

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event and return its id; concurrent inserts are serialized
    async fn insert(&self, event: &NewDetectionEvent) -> Result<i64>;

    /// Newest first, optionally only matched or only unmatched
    async fn list(&self, limit: u32, matched: Option<bool>) -> Result<Vec<DetectionEvent>>;

    async fn get(&self, id: i64) -> Result<Option<DetectionEvent>>;

    async fn query(&self, query: &EventQuery) -> Result<EventPage>;

    async fn summary(&self) -> Result<EventSummary>;
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<DetectionEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn compare(a: &DetectionEvent, b: &DetectionEvent, column: SortColumn) -> Ordering {
    let (x, y) = (&a.event, &b.event);
    let primary = match column {
        SortColumn::Ts => x.ts.cmp(&y.ts),
        SortColumn::Confidence => x.confidence.total_cmp(&y.confidence),
        SortColumn::QualityScore => x.quality_score.total_cmp(&y.quality_score),
        SortColumn::FaceSize => x.face_size.cmp(&y.face_size),
        SortColumn::CameraId => x.camera_id.cmp(&y.camera_id),
    };
    primary.then(a.id.cmp(&b.id))
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, event: &NewDetectionEvent) -> Result<i64> {
        let mut events = self.events.write().await;
        let id = events.last().map(|e| e.id + 1).unwrap_or(1);
        events.push(event.clone().with_id(id));
        Ok(id)
    }

    async fn list(&self, limit: u32, matched: Option<bool>) -> Result<Vec<DetectionEvent>> {
        let events = self.events.read().await;
        let mut selected: Vec<DetectionEvent> = events
            .iter()
            .filter(|e| matched.map_or(true, |m| e.event.matched == m))
            .cloned()
            .collect();
        selected.sort_by(|a, b| compare(b, a, SortColumn::Ts));
        selected.truncate(limit as usize);
        Ok(selected)
    }

    async fn get(&self, id: i64) -> Result<Option<DetectionEvent>> {
        Ok(self.events.read().await.iter().find(|e| e.id == id).cloned())
    }

    async fn query(&self, query: &EventQuery) -> Result<EventPage> {
        let query = query.clone().normalized(now_millis());
        let events = self.events.read().await;

        let mut selected: Vec<&DetectionEvent> =
            events.iter().filter(|e| query.matches(&e.event)).collect();
        selected.sort_by(|a, b| match query.order {
            SortOrder::Asc => compare(a, b, query.sort_by),
            SortOrder::Desc => compare(b, a, query.sort_by),
        });

        let total = selected.len() as u64;
        let page = selected
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit as usize)
            .cloned()
            .collect();

        Ok(EventPage::new(page, total, &query))
    }

    async fn summary(&self) -> Result<EventSummary> {
        let events = self.events.read().await;
        let total = events.len() as u64;
        let average_quality = (total > 0).then(|| {
            events.iter().map(|e| e.event.quality_score).sum::<f32>() / total as f32
        });
        Ok(EventSummary {
            total,
            matched: events.iter().filter(|e| e.event.matched).count() as u64,
            low_quality: events.iter().filter(|e| e.event.is_low_quality).count() as u64,
            average_quality,
        })
    }
}

// ============================================================================
// Postgres
// ============================================================================

pub struct PgEventStore {
    pool: PgPool,
    write_lock: Mutex<()>,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }
}

const SELECT_COLUMNS: &str = "SELECT id, camera_id, ts, confidence, bbox_x1, bbox_y1, bbox_x2, bbox_y2, \
     thumb_relpath, matched, person_id, person_name, quality_score, is_low_quality, \
     full_image_path, face_size, alert_level, event_type, detection_score, extra FROM events";

fn row_to_event(row: &PgRow) -> Result<DetectionEvent> {
    let alert_level: String = row.try_get("alert_level")?;
    let event_type: String = row.try_get("event_type")?;
    let event = NewDetectionEvent {
        camera_id: row.try_get("camera_id")?,
        ts: row.try_get("ts")?,
        confidence: row.try_get("confidence")?,
        bbox: BoundingBox::new(
            row.try_get("bbox_x1")?,
            row.try_get("bbox_y1")?,
            row.try_get("bbox_x2")?,
            row.try_get("bbox_y2")?,
        ),
        thumb_relpath: row.try_get("thumb_relpath")?,
        matched: row.try_get("matched")?,
        person_id: row.try_get("person_id")?,
        person_name: row.try_get("person_name")?,
        quality_score: row.try_get("quality_score")?,
        is_low_quality: row.try_get("is_low_quality")?,
        full_image_path: row.try_get("full_image_path")?,
        face_size: row.try_get("face_size")?,
        alert_level: alert_level.parse()?,
        event_type: event_type.parse()?,
        detection_score: row.try_get("detection_score")?,
        extra: row.try_get("extra")?,
    };
    Ok(event.with_id(row.try_get("id")?))
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &EventQuery) {
    qb.push(" WHERE TRUE");
    if let Some(start) = query.start_ms {
        qb.push(" AND ts >= ").push_bind(start);
    }
    if let Some(end) = query.end_ms {
        qb.push(" AND ts <= ").push_bind(end);
    }
    if query.matched_only {
        qb.push(" AND matched");
    }
    if let Some(min) = query.min_confidence {
        qb.push(" AND confidence >= ").push_bind(min);
    }
    if let Some(max) = query.max_confidence {
        qb.push(" AND confidence <= ").push_bind(max);
    }
    if let Some(name) = query.person_name.as_deref().filter(|n| !n.is_empty()) {
        qb.push(" AND person_name ILIKE ")
            .push_bind(format!("%{}%", escape_like(name)));
    }
    if let Some(min) = query.min_quality {
        qb.push(" AND quality_score >= ").push_bind(min);
    }
    if let Some(max) = query.max_quality {
        qb.push(" AND quality_score <= ").push_bind(max);
    }
    if query.exclude_low_quality {
        qb.push(" AND NOT is_low_quality");
    }
    if let Some(size) = query.min_face_size {
        qb.push(" AND face_size >= ").push_bind(size);
    }
    if !query.camera_ids.is_empty() {
        qb.push(" AND camera_id = ANY(")
            .push_bind(query.camera_ids.clone())
            .push(")");
    }
    if !query.alert_levels.is_empty() {
        let levels: Vec<String> = query.alert_levels.iter().map(|l| l.to_string()).collect();
        qb.push(" AND alert_level = ANY(").push_bind(levels).push(")");
    }
    if !query.event_types.is_empty() {
        let types: Vec<String> = query.event_types.iter().map(|t| t.to_string()).collect();
        qb.push(" AND event_type = ANY(").push_bind(types).push(")");
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert(&self, event: &NewDetectionEvent) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let row = sqlx::query(
            r#"
            INSERT INTO events
              (camera_id, ts, confidence, bbox_x1, bbox_y1, bbox_x2, bbox_y2, thumb_relpath,
               matched, person_id, person_name, quality_score, is_low_quality, full_image_path,
               face_size, alert_level, event_type, detection_score, extra)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            RETURNING id
            "#,
        )
        .bind(&event.camera_id)
        .bind(event.ts)
        .bind(event.confidence)
        .bind(event.bbox.x1)
        .bind(event.bbox.y1)
        .bind(event.bbox.x2)
        .bind(event.bbox.y2)
        .bind(&event.thumb_relpath)
        .bind(event.matched)
        .bind(&event.person_id)
        .bind(&event.person_name)
        .bind(event.quality_score)
        .bind(event.is_low_quality)
        .bind(&event.full_image_path)
        .bind(event.face_size)
        .bind(event.alert_level.as_str())
        .bind(event.event_type.as_str())
        .bind(event.detection_score)
        .bind(&event.extra)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert event")?;

        Ok(row.try_get("id")?)
    }

    async fn list(&self, limit: u32, matched: Option<bool>) -> Result<Vec<DetectionEvent>> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        if let Some(matched) = matched {
            qb.push(" WHERE matched = ").push_bind(matched);
        }
        qb.push(" ORDER BY ts DESC, id DESC LIMIT ")
            .push_bind(i64::from(limit));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn get(&self, id: i64) -> Result<Option<DetectionEvent>> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        qb.push(" WHERE id = ").push_bind(id);
        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn query(&self, query: &EventQuery) -> Result<EventPage> {
        let query = query.clone().normalized(now_millis());

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM events");
        push_filters(&mut count, &query);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        push_filters(&mut select, &query);
        let order = query.order.keyword();
        select
            .push(" ORDER BY ")
            .push(query.sort_by.column())
            .push(" ")
            .push(order)
            .push(", id ")
            .push(order)
            .push(" LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));

        let rows = select.build().fetch_all(&self.pool).await?;
        let events = rows.iter().map(row_to_event).collect::<Result<Vec<_>>>()?;

        Ok(EventPage::new(events, u64::try_from(total).unwrap_or(0), &query))
    }

    async fn summary(&self) -> Result<EventSummary> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE matched) AS matched,
                   COUNT(*) FILTER (WHERE is_low_quality) AS low_quality,
                   AVG(quality_score)::REAL AS average_quality
            FROM events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |name: &str| -> Result<u64> {
            let n: i64 = row.try_get(name)?;
            Ok(u64::try_from(n).unwrap_or(0))
        };

        Ok(EventSummary {
            total: count("total")?,
            matched: count("matched")?,
            low_quality: count("low_quality")?,
            average_quality: row.try_get("average_quality")?,
        })
    }
}
