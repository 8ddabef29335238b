//! ContentMetadata - slowly changing reference dimension keyed by content id

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Podcast,
    Newsletter,
    Video,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Podcast => "podcast",
            Self::Newsletter => "newsletter",
            Self::Video => "video",
        })
    }
}

/// Reference metadata for one piece of content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub content_id: Uuid,
    #[serde(default)]
    pub slug: String,
    pub title: String,
    pub content_type: ContentType,
    /// Nominal length; `None` for content without a duration (e.g. newsletters)
    #[serde(default)]
    pub length_seconds: Option<i64>,
}
