//! Synthetic engagement traffic
//!
//! Mirrors realistic production mix: weighted event types, a device pool
//! split between mobile and web, device-dependent durations and a small
//! client payload.

use chrono::{DateTime, Duration, Utc};
use contracts::{ContentMetadata, ContentType, EventType, RawEvent};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

const EVENT_TYPE_WEIGHTS: [(EventType, f64); 4] = [
    (EventType::Play, 0.4),
    (EventType::Pause, 0.25),
    (EventType::Finish, 0.2),
    (EventType::Click, 0.15),
];

const DEVICES: [&str; 6] = [
    "ios",
    "android",
    "web-chrome",
    "web-safari",
    "web-firefox",
    "web-edge",
];

const REFERRERS: [Option<&str>; 5] = [
    Some("https://google.com"),
    Some("https://twitter.com"),
    Some("https://linkedin.com"),
    Some("direct"),
    None,
];

const SCREEN_RESOLUTIONS: [&str; 5] = ["1920x1080", "1366x768", "375x667", "414x896", "360x640"];

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Fixed seed for reproducible output
    pub seed: Option<u64>,
    /// Size of the synthetic content catalog
    pub content_count: usize,
    /// Size of the user pool
    pub user_count: usize,
    /// Id assigned to the first generated event
    pub first_event_id: u64,
    /// `event_ts` lags the requested time by up to this many seconds
    pub max_clock_skew_secs: i64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            seed: None,
            content_count: 20,
            user_count: 1_000,
            first_event_id: 1,
            max_clock_skew_secs: 10,
        }
    }
}

pub struct EventGenerator {
    rng: StdRng,
    catalog: Vec<ContentMetadata>,
    users: Vec<Uuid>,
    next_id: u64,
    max_clock_skew_secs: i64,
}

impl EventGenerator {
    /// Generator over a freshly generated catalog
    pub fn new(config: GeneratorConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let catalog = synthetic_catalog(&mut rng, config.content_count.max(1));
        Self::build(rng, catalog, &config)
    }

    /// Generator over an existing catalog (e.g. the reference file)
    pub fn with_catalog(config: GeneratorConfig, catalog: Vec<ContentMetadata>) -> Self {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let catalog = if catalog.is_empty() {
            synthetic_catalog(&mut rng, config.content_count.max(1))
        } else {
            catalog
        };
        Self::build(rng, catalog, &config)
    }

    fn build(mut rng: StdRng, catalog: Vec<ContentMetadata>, config: &GeneratorConfig) -> Self {
        let users = (0..config.user_count.max(1))
            .map(|_| Uuid::from_u128(rng.random()))
            .collect();
        Self {
            rng,
            catalog,
            users,
            next_id: config.first_event_id,
            max_clock_skew_secs: config.max_clock_skew_secs.max(0),
        }
    }

    pub fn catalog(&self) -> &[ContentMetadata] {
        &self.catalog
    }

    /// One event observed around `now` (lagging by the configured skew)
    pub fn next_event(&mut self, now: DateTime<Utc>) -> RawEvent {
        let skew = self.rng.random_range(0..=self.max_clock_skew_secs);
        self.event_at(now - Duration::seconds(skew))
    }

    /// `count` events with strictly increasing ids and timestamps
    /// `start, start + spacing, ...`
    pub fn generate(&mut self, count: usize, start: DateTime<Utc>, spacing: Duration) -> Vec<RawEvent> {
        (0..count)
            .map(|i| self.event_at(start + spacing * i as i32))
            .collect()
    }

    fn event_at(&mut self, event_ts: DateTime<Utc>) -> RawEvent {
        let id = self.next_id;
        self.next_id += 1;

        let content_id = self
            .catalog
            .choose(&mut self.rng)
            .map_or_else(Uuid::nil, |c| c.content_id);
        let user_id = self.users.choose(&mut self.rng).copied().unwrap_or_default();
        let event_type = EVENT_TYPE_WEIGHTS
            .choose_weighted(&mut self.rng, |(_, weight)| *weight)
            .map_or(EventType::Play, |(event_type, _)| *event_type);
        let device = DEVICES.choose(&mut self.rng).copied().unwrap_or("web-chrome");

        RawEvent {
            id,
            content_id,
            user_id,
            event_type,
            event_ts,
            duration_ms: self.duration_for(event_type, device),
            device: Some(device.to_string()),
            extra: Some(self.client_payload(device)),
        }
    }

    fn duration_for(&mut self, event_type: EventType, device: &str) -> Option<u64> {
        let web = device.starts_with("web");
        match event_type {
            EventType::Play | EventType::Pause => {
                let ceiling = if web { 15_000 } else { 8_000 };
                Some(self.rng.random_range(1_000..=ceiling))
            }
            EventType::Finish => {
                let ceiling = if web { 180_000 } else { 120_000 };
                Some(self.rng.random_range(30_000..=ceiling))
            }
            EventType::Click => None,
        }
    }

    fn client_payload(&mut self, device: &str) -> serde_json::Value {
        let referrer = REFERRERS.choose(&mut self.rng).copied().flatten();
        let resolution = SCREEN_RESOLUTIONS.choose(&mut self.rng).copied();
        let ip = format!(
            "{}.{}.{}.{}",
            self.rng.random_range(1..=255u8),
            self.rng.random::<u8>(),
            self.rng.random::<u8>(),
            self.rng.random_range(1..=255u8)
        );
        serde_json::json!({
            "session_id": Uuid::from_u128(self.rng.random()).to_string(),
            "ip_address": ip,
            "user_agent": device,
            "referrer": referrer,
            "screen_resolution": resolution,
        })
    }
}

/// Catalog cycling podcast / newsletter / video with plausible lengths
fn synthetic_catalog(rng: &mut StdRng, count: usize) -> Vec<ContentMetadata> {
    (0..count)
        .map(|i| {
            let (content_type, length_seconds) = match i % 3 {
                0 => (ContentType::Podcast, Some(rng.random_range(900..=3_600))),
                1 => (ContentType::Newsletter, None),
                _ => (ContentType::Video, Some(rng.random_range(120..=1_800))),
            };
            ContentMetadata {
                content_id: Uuid::from_u128(rng.random()),
                slug: format!("{content_type}-{i}"),
                title: format!("Sample {content_type} #{i}"),
                content_type,
                length_seconds,
            }
        })
        .collect()
}
