//! Artifact helpers: mime inference and display payload capture.

use std::path::Path;

/// Infer a mime type from a file extension.
///
/// Inference is extension-only; content sniffing is deliberately avoided so
/// the result is stable across scans of the same file.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("log") => "text/plain",
        Some("md") => "text/markdown",
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("py") => "text/x-python",
        Some("js") => "text/javascript",
        Some("xml") => "application/xml",
        Some("parquet") => "application/vnd.apache.parquet",
        _ => "application/octet-stream",
    }
}

/// File extension for a display payload mime type.
pub fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "text/html" => "html",
        "application/json" => "json",
        "text/plain" => "txt",
        _ => "bin",
    }
}

/// Stable file name for the `n`-th display payload of an execution.
pub fn display_file_name(exec_id: &str, index: usize, mime: &str) -> String {
    format!("{}-{}.{}", exec_id, index, extension_for_mime(mime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn infers_common_types() {
        assert_eq!(mime_for_path(&PathBuf::from("a.txt")), "text/plain");
        assert_eq!(mime_for_path(&PathBuf::from("plot.PNG")), "image/png");
        assert_eq!(mime_for_path(&PathBuf::from("data.csv")), "text/csv");
        assert_eq!(
            mime_for_path(&PathBuf::from("blob")),
            "application/octet-stream"
        );
    }

    #[test]
    fn display_names_are_stable() {
        assert_eq!(display_file_name("e1", 0, "image/png"), "e1-0.png");
        assert_eq!(display_file_name("e1", 2, "who/knows"), "e1-2.bin");
    }
}
