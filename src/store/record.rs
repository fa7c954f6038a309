use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aspect ratio meaning "keep the reference image's proportions".
pub const MATCH_INPUT_IMAGE: &str = "match_input_image";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImageRecord {
    pub id: u64,
    pub prompt: String,
    pub image_url: String,
    pub image_data: Option<String>,
    pub thumbnail_data: Option<String>,
    pub input_image_url: Option<String>,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: String,
    pub cost: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields of a record before the store assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImageRecord {
    pub prompt: String,
    pub image_url: String,
    pub image_data: Option<String>,
    pub thumbnail_data: Option<String>,
    pub input_image_url: Option<String>,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: Option<String>,
    pub cost: Option<String>,
}

impl NewImageRecord {
    pub fn into_record(self, id: u64, created_at: DateTime<Utc>) -> GeneratedImageRecord {
        GeneratedImageRecord {
            id,
            prompt: self.prompt,
            image_url: self.image_url,
            image_data: self.image_data,
            thumbnail_data: self.thumbnail_data,
            input_image_url: self.input_image_url,
            width: self.width,
            height: self.height,
            aspect_ratio: self
                .aspect_ratio
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| MATCH_INPUT_IMAGE.to_string()),
            cost: self.cost,
            created_at,
        }
    }
}

/// Newest first; ids break timestamp ties.
pub(crate) fn sort_newest_first(records: &mut [GeneratedImageRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}
