//! Enrichment engine

use chrono::{DateTime, Utc};
use contracts::{ContentMetadata, EnrichedEvent, RawEvent};

/// Build the enriched view of `raw`.
///
/// Deterministic for the same inputs. Missing metadata yields `None` content
/// fields; a missing duration or a missing / non-positive length yields a
/// `None` percentage. Never produces NaN or infinity.
pub fn enrich(
    raw: &RawEvent,
    metadata: Option<&ContentMetadata>,
    processed_at: DateTime<Utc>,
) -> EnrichedEvent {
    let engagement_seconds = raw
        .duration_ms
        .map(|ms| round2(ms as f64 / 1000.0))
        .filter(|s| s.is_finite());

    let length_seconds = metadata.and_then(|m| m.length_seconds);
    let engagement_pct = match (engagement_seconds, length_seconds) {
        (Some(seconds), Some(length)) if length > 0 => {
            Some(round2(seconds / length as f64 * 100.0)).filter(|p| p.is_finite())
        }
        _ => None,
    };

    EnrichedEvent {
        id: raw.id,
        content_id: raw.content_id,
        user_id: raw.user_id,
        event_type: raw.event_type,
        event_ts: raw.event_ts,
        duration_ms: raw.duration_ms,
        device: raw.device.clone(),
        extra: raw.extra.clone(),
        content_slug: metadata.map(|m| m.slug.clone()),
        content_title: metadata.map(|m| m.title.clone()),
        content_type: metadata.map(|m| m.content_type),
        content_length_seconds: length_seconds,
        engagement_seconds,
        engagement_pct,
        processed_at,
    }
}

/// Round half away from zero to 2 decimals
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
