use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a photo documents within a job
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PhotoCategory {
    Before,
    After,
    Issue,
    #[default]
    Other,
}

impl PhotoCategory {
    pub fn as_str(&self) -> &str {
        match self {
            PhotoCategory::Before => "before",
            PhotoCategory::After => "after",
            PhotoCategory::Issue => "issue",
            PhotoCategory::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "before" => PhotoCategory::Before,
            "after" => PhotoCategory::After,
            "issue" => PhotoCategory::Issue,
            _ => PhotoCategory::Other, // Default fallback
        }
    }
}

/// Caller-supplied linkage of a photo to the job it belongs to
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PhotoMetadata {
    pub job_id: String,
    pub category: PhotoCategory,
    pub caption: Option<String>,
    pub room_label: Option<String>,
    pub is_issue_photo: bool,
    pub issue_id: Option<String>,
}

impl PhotoMetadata {
    pub fn new(job_id: impl Into<String>, category: PhotoCategory) -> Self {
        Self {
            job_id: job_id.into(),
            category,
            ..Default::default()
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn with_room(mut self, room_label: impl Into<String>) -> Self {
        self.room_label = Some(room_label.into());
        self
    }

    /// Marks the photo as documenting an issue
    pub fn with_issue(mut self, issue_id: Option<String>) -> Self {
        self.is_issue_photo = true;
        self.issue_id = issue_id;
        self
    }

    /// Flat key/value form attached to every stored object
    pub fn to_storage_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("job_id".to_string(), self.job_id.clone());
        map.insert("category".to_string(), self.category.as_str().to_string());
        map.insert("is_issue_photo".to_string(), self.is_issue_photo.to_string());
        if let Some(caption) = &self.caption {
            map.insert("caption".to_string(), caption.clone());
        }
        if let Some(room) = &self.room_label {
            map.insert("room_label".to_string(), room.clone());
        }
        if let Some(issue) = &self.issue_id {
            map.insert("issue_id".to_string(), issue.clone());
        }
        map
    }
}

/// Raw capture handed to the queue
#[derive(Debug, Clone)]
pub struct PhotoInput {
    pub bytes: Vec<u8>,
    pub original_name: String,
    pub metadata: PhotoMetadata,
}

impl PhotoInput {
    pub fn new(bytes: Vec<u8>, original_name: impl Into<String>, metadata: PhotoMetadata) -> Self {
        Self {
            bytes,
            original_name: original_name.into(),
            metadata,
        }
    }
}
