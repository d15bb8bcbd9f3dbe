//! Upload content types derived from object names.

/// Used when the extension is missing or unknown.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Guesses a content type from the extension of the object name's last
/// path segment.
pub fn content_type_for(object_name: &str) -> &'static str {
    let file_name = object_name.rsplit('/').next().unwrap_or(object_name);
    let extension = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => return DEFAULT_CONTENT_TYPE,
    };

    match extension.as_str() {
        "txt" | "text" | "log" => "text/plain",
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "html" | "htm" => "text/html",
        "xml" => "text/xml",
        "css" => "text/css",
        "js" => "text/javascript",
        "md" => "text/markdown",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_extensions() {
        assert_eq!(content_type_for("job-1/morphology.json"), "application/json");
        assert_eq!(content_type_for("job-1/tokens.CSV"), "text/csv");
        assert_eq!(content_type_for("report.txt"), "text/plain");
        assert_eq!(content_type_for("a/b/c.tar"), "application/x-tar");
    }

    #[test]
    fn test_unknown_or_missing_extension() {
        assert_eq!(content_type_for("job-1/tokens"), DEFAULT_CONTENT_TYPE);
        assert_eq!(content_type_for("job-1/data.bin"), DEFAULT_CONTENT_TYPE);
        assert_eq!(content_type_for("job-1/.hidden"), DEFAULT_CONTENT_TYPE);
        // directory dots do not count
        assert_eq!(content_type_for("v1.2/readme"), DEFAULT_CONTENT_TYPE);
    }
}
