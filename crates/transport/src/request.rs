//! REST request and response shapes.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A post as submitted by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDraft {
    /// Post title.
    pub title: String,
    /// Rendered HTML body.
    #[serde(default)]
    pub content: String,
    /// WordPress post status (`publish`, `draft`, `pending`, ...).
    #[serde(default = "default_status")]
    pub status: String,
    /// Existing media ID to use as featured image.
    #[serde(default, alias = "featured_media_id")]
    pub featured_media: Option<u64>,
    /// Category IDs.
    #[serde(default)]
    pub categories: Vec<u64>,
    /// Tag IDs.
    #[serde(default)]
    pub tags: Vec<u64>,
    /// Local image uploaded as featured image when `featured_media` is unset.
    #[serde(default, alias = "image_url")]
    pub image_path: Option<PathBuf>,
}

fn default_status() -> String {
    "publish".to_string()
}

impl PostDraft {
    /// Create a draft that publishes immediately.
    #[must_use]
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            status: default_status(),
            featured_media: None,
            categories: Vec::new(),
            tags: Vec::new(),
            image_path: None,
        }
    }

    /// JSON body for `POST /posts`.
    #[must_use]
    pub fn request_body(&self, featured_media: Option<u64>) -> Value {
        let mut body = json!({
            "title": self.title,
            "content": self.content,
            "status": self.status,
        });
        if let Some(map) = body.as_object_mut() {
            if let Some(id) = featured_media.or(self.featured_media) {
                map.insert("featured_media".to_string(), json!(id));
            }
            if !self.categories.is_empty() {
                map.insert("categories".to_string(), json!(self.categories));
            }
            if !self.tags.is_empty() {
                map.insert("tags".to_string(), json!(self.tags));
            }
        }
        body
    }
}

/// One REST operation.
#[derive(Debug, Clone)]
pub enum ApiRequest {
    /// `POST /media` with a binary body.
    UploadMedia {
        filename: String,
        mime: &'static str,
        data: Bytes,
    },
    /// `POST /posts` with a JSON body.
    CreatePost { body: Value },
    /// `GET /users/me`.
    CurrentUser,
}

impl ApiRequest {
    /// Path relative to `/wp-json/wp/v2`.
    #[must_use]
    pub const fn path(&self) -> &'static str {
        match self {
            Self::UploadMedia { .. } => "media",
            Self::CreatePost { .. } => "posts",
            Self::CurrentUser => "users/me",
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::UploadMedia { .. } => "upload_media",
            Self::CreatePost { .. } => "create_post",
            Self::CurrentUser => "current_user",
        }
    }
}

/// Successful REST response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

/// Response of `POST /media`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MediaItem {
    pub id: u64,
    pub source_url: String,
}

/// Response of `POST /posts`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedPost {
    pub id: u64,
    pub link: String,
}

/// MIME type from the file extension. Unknown extensions are sent as JPEG.
#[must_use]
pub fn detect_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_mime() {
        assert_eq!(detect_mime(Path::new("a/b/cover.PNG")), "image/png");
        assert_eq!(detect_mime(Path::new("anim.gif")), "image/gif");
        assert_eq!(detect_mime(Path::new("x.webp")), "image/webp");
        assert_eq!(detect_mime(Path::new("photo.jpeg")), "image/jpeg");
        assert_eq!(detect_mime(Path::new("noext")), "image/jpeg");
    }

    #[test]
    fn test_request_body_minimal() {
        let draft = PostDraft::new("Hello", "<p>World</p>");
        let body = draft.request_body(None);

        assert_eq!(body["title"], "Hello");
        assert_eq!(body["status"], "publish");
        assert!(body.get("featured_media").is_none());
        assert!(body.get("categories").is_none());
    }

    #[test]
    fn test_request_body_uploaded_media_wins() {
        let mut draft = PostDraft::new("Hello", "");
        draft.featured_media = Some(7);
        draft.tags = vec![3, 4];

        assert_eq!(draft.request_body(None)["featured_media"], 7);
        assert_eq!(draft.request_body(Some(42))["featured_media"], 42);
        assert_eq!(draft.request_body(None)["tags"], json!([3, 4]));
    }

    #[test]
    fn test_draft_deserialize_aliases() {
        let draft: PostDraft = serde_json::from_value(json!({
            "title": "T",
            "image_url": "img/cover.png",
            "featured_media_id": 9
        }))
        .unwrap();

        assert_eq!(draft.status, "publish");
        assert_eq!(draft.image_path, Some(PathBuf::from("img/cover.png")));
        assert_eq!(draft.featured_media, Some(9));
    }
}
