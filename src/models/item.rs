use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// File extensions the engine accepts as input.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Output image formats the remote service can convert to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Png,
    Jpeg,
    Webp,
    Avif,
}

impl ImageKind {
    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Png => "png",
            ImageKind::Jpeg => "jpg",
            ImageKind::Webp => "webp",
            ImageKind::Avif => "avif",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageKind::Png => "image/png",
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Webp => "image/webp",
            ImageKind::Avif => "image/avif",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(ImageKind::Png),
            "jpg" | "jpeg" => Some(ImageKind::Jpeg),
            "webp" => Some(ImageKind::Webp),
            "avif" => Some(ImageKind::Avif),
            _ => None,
        }
    }
}

/// Whether the result keeps the source format or is converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTarget {
    #[default]
    Keep,
    Convert(ImageKind),
}

/// Resize strategies understood by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMethod {
    Scale,
    Fit,
    Cover,
    Thumb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeSpec {
    pub method: ResizeMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Per-item transform options requested from the remote service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetOptions {
    #[serde(default)]
    pub format: FormatTarget,
    #[serde(default)]
    pub resize: Option<ResizeSpec>,
    #[serde(default)]
    pub preserve_metadata: bool,
}

impl TargetOptions {
    /// True when the compressed bytes need a second transform pass
    /// (conversion, resize, or metadata preservation).
    pub fn needs_transform(&self) -> bool {
        self.format != FormatTarget::Keep || self.resize.is_some() || self.preserve_metadata
    }

    /// JSON body for the transform request. Options are applied in a fixed
    /// contract order: convert, then resize, then metadata preservation.
    pub fn to_request_body(&self) -> Option<serde_json::Value> {
        if !self.needs_transform() {
            return None;
        }
        let mut body = serde_json::Map::new();
        if let FormatTarget::Convert(kind) = self.format {
            body.insert(
                "convert".to_string(),
                serde_json::json!({ "type": kind.mime_type() }),
            );
        }
        if let Some(resize) = &self.resize {
            let mut spec = serde_json::Map::new();
            spec.insert("method".to_string(), serde_json::json!(resize.method));
            if let Some(w) = resize.width {
                spec.insert("width".to_string(), serde_json::json!(w));
            }
            if let Some(h) = resize.height {
                spec.insert("height".to_string(), serde_json::json!(h));
            }
            body.insert("resize".to_string(), serde_json::Value::Object(spec));
        }
        if self.preserve_metadata {
            body.insert(
                "preserve".to_string(),
                serde_json::json!(["copyright", "creation", "location"]),
            );
        }
        Some(serde_json::Value::Object(body))
    }
}

/// One unit of work: a source file plus its requested transform options.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub source: PathBuf,
    pub size: u64,
    pub options: TargetOptions,
}

impl WorkItem {
    pub fn new(source: PathBuf, size: u64, options: TargetOptions) -> Self {
        Self {
            source,
            size,
            options,
        }
    }

    /// Final path the optimized result is installed at. Differs from the
    /// source only when a format conversion changes the extension.
    pub fn destination(&self) -> PathBuf {
        match self.options.format {
            FormatTarget::Keep => self.source.clone(),
            FormatTarget::Convert(kind) => self.source.with_extension(kind.extension()),
        }
    }

    pub fn file_name(&self) -> &str {
        self.source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("<non-utf8>")
    }
}

/// Returns true when `path` has a supported image extension.
pub fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_keeps_path_without_conversion() {
        let item = WorkItem::new("photos/cat.png".into(), 100, TargetOptions::default());
        assert_eq!(item.destination(), PathBuf::from("photos/cat.png"));
    }

    #[test]
    fn test_destination_swaps_extension_on_conversion() {
        let options = TargetOptions {
            format: FormatTarget::Convert(ImageKind::Webp),
            ..Default::default()
        };
        let item = WorkItem::new("photos/cat.png".into(), 100, options);
        assert_eq!(item.destination(), PathBuf::from("photos/cat.webp"));
    }

    #[test]
    fn test_plain_compression_needs_no_transform_body() {
        assert!(TargetOptions::default().to_request_body().is_none());
    }

    #[test]
    fn test_request_body_contains_convert_and_resize() {
        let options = TargetOptions {
            format: FormatTarget::Convert(ImageKind::Webp),
            resize: Some(ResizeSpec {
                method: ResizeMethod::Fit,
                width: Some(800),
                height: Some(600),
            }),
            preserve_metadata: true,
        };
        let body = options.to_request_body().unwrap();
        assert_eq!(body["convert"]["type"], "image/webp");
        assert_eq!(body["resize"]["method"], "fit");
        assert_eq!(body["resize"]["width"], 800);
        assert!(body["preserve"].is_array());
    }

    #[test]
    fn test_supported_extensions() {
        assert!(has_supported_extension(Path::new("a.PNG")));
        assert!(has_supported_extension(Path::new("a.jpeg")));
        assert!(!has_supported_extension(Path::new("a.gif")));
        assert!(!has_supported_extension(Path::new("noext")));
    }
}
