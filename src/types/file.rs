use std::path::Path;

/// MIME type and extension guessed for an upload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentType {
    pub mime_type: Option<String>,
    pub extension: Option<String>,
}

pub struct FileTypeDetector;

impl FileTypeDetector {
    /// Sniffs the leading bytes of a file. The path's own extension wins
    /// over the sniffed one; an unrecognized payload keeps only that.
    pub fn detect(path: &Path, head: &[u8]) -> ContentType {
        let path_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match infer::get(head) {
            Some(kind) => ContentType {
                mime_type: Some(kind.mime_type().to_string()),
                extension: path_extension.or_else(|| Some(kind.extension().to_string())),
            },
            None => ContentType {
                mime_type: None,
                extension: path_extension,
            },
        }
    }
}
