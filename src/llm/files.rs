//! File references carried by task inputs.
//!
//! A file is either a URL, inline base64 data, or both once downloaded. Files are
//! located inside the task input by a key path so that downloaded or transformed
//! content can be put back where it came from.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A file referenced by the task input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct File {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Base64 encoded content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Broad media category of a file, derived from its content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Pdf,
    Audio,
    Text,
    Other,
}

impl File {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn from_data(data: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            url: None,
            data: Some(data.into()),
            content_type: Some(content_type.into()),
        }
    }

    /// Parse a file from an input value. Data URLs are split into data and content type.
    pub fn from_value(value: &Value) -> Option<Self> {
        let mut file: File = serde_json::from_value(value.clone()).ok()?;
        if file.url.is_none() && file.data.is_none() {
            return None;
        }
        if file.data.is_none() {
            if let Some((content_type, data)) = file.url.as_deref().and_then(parse_data_url) {
                file.data = Some(data);
                if file.content_type.is_none() {
                    file.content_type = Some(content_type);
                }
            }
        }
        Some(file)
    }

    /// Content type, falling back to a guess from the URL extension.
    pub fn resolved_content_type(&self) -> Option<String> {
        if let Some(ct) = &self.content_type {
            return Some(ct.to_ascii_lowercase());
        }
        let url = self.url.as_deref()?;
        let path = url::Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.to_string());
        let ext = path.rsplit('.').next()?.to_ascii_lowercase();
        let guessed = match ext.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "pdf" => "application/pdf",
            "mp3" => "audio/mpeg",
            "wav" => "audio/wav",
            "ogg" => "audio/ogg",
            "flac" => "audio/flac",
            "txt" => "text/plain",
            "md" => "text/markdown",
            "csv" => "text/csv",
            "html" | "htm" => "text/html",
            _ => return None,
        };
        Some(guessed.to_string())
    }

    pub fn kind(&self) -> FileKind {
        match self.resolved_content_type() {
            Some(ct) if ct.starts_with("image/") => FileKind::Image,
            Some(ct) if ct == "application/pdf" => FileKind::Pdf,
            Some(ct) if ct.starts_with("audio/") => FileKind::Audio,
            Some(ct) if ct.starts_with("text/") => FileKind::Text,
            _ => FileKind::Other,
        }
    }

    pub fn is_text(&self) -> bool {
        self.kind() == FileKind::Text
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Decoded bytes of the inline data.
    pub fn decoded_data(&self) -> Option<Vec<u8>> {
        self.data.as_deref().and_then(|d| STANDARD.decode(d).ok())
    }

    /// Decoded inline data as UTF-8 text (lossy).
    pub fn decoded_text(&self) -> Option<String> {
        self.decoded_data()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// URL suitable for providers: the remote URL, or a data URL built from inline data.
    pub fn to_url(&self) -> Option<String> {
        match (&self.data, &self.url) {
            (Some(data), _) => Some(format!(
                "data:{};base64,{}",
                self.resolved_content_type()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                data
            )),
            (None, Some(url)) => Some(url.clone()),
            (None, None) => None,
        }
    }
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let content_type = header.strip_suffix(";base64")?;
    Some((content_type.to_string(), data.to_string()))
}

/// One step of a key path inside a JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPathSegment {
    Key(String),
    Index(usize),
}

/// A file together with where it lives inside the task input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileWithKeyPath {
    pub file: File,
    pub key_path: Vec<KeyPathSegment>,
}

impl FileWithKeyPath {
    /// JSON pointer (RFC 6901) of the file inside the input.
    pub fn pointer(&self) -> String {
        key_path_pointer(&self.key_path)
    }
}

pub fn key_path_pointer(path: &[KeyPathSegment]) -> String {
    let mut out = String::new();
    for segment in path {
        out.push('/');
        match segment {
            KeyPathSegment::Key(k) => out.push_str(&k.replace('~', "~0").replace('/', "~1")),
            KeyPathSegment::Index(i) => out.push_str(&i.to_string()),
        }
    }
    out
}

/// Replace the value at `path` inside `root`. Returns false if the path does not exist.
pub fn set_at_key_path(root: &mut Value, path: &[KeyPathSegment], value: Value) -> bool {
    match root.pointer_mut(&key_path_pointer(path)) {
        Some(slot) => {
            *slot = value;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_from_content_type_and_extension() {
        assert_eq!(File::from_url("https://x.com/a/cat.PNG").kind(), FileKind::Image);
        assert_eq!(File::from_url("https://x.com/doc.pdf?sig=1").kind(), FileKind::Pdf);
        assert_eq!(File::from_data("aGk=", "text/plain").kind(), FileKind::Text);
        assert_eq!(File::from_url("https://x.com/blob").kind(), FileKind::Other);
    }

    #[test]
    fn test_data_url_is_split() {
        let file = File::from_value(&json!({"url": "data:image/png;base64,aGVsbG8="})).unwrap();
        assert_eq!(file.data.as_deref(), Some("aGVsbG8="));
        assert_eq!(file.content_type.as_deref(), Some("image/png"));
        assert_eq!(file.decoded_text().unwrap(), "hello");
    }

    #[test]
    fn test_set_at_key_path() {
        let mut input = json!({"docs": [{"f": 1}, {"f": 2}]});
        let path = vec![
            KeyPathSegment::Key("docs".into()),
            KeyPathSegment::Index(1),
            KeyPathSegment::Key("f".into()),
        ];
        assert!(set_at_key_path(&mut input, &path, json!("text")));
        assert_eq!(input, json!({"docs": [{"f": 1}, {"f": "text"}]}));
        assert!(!set_at_key_path(&mut input, &[KeyPathSegment::Key("nope".into())], json!(1)));
    }
}
