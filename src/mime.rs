//! MIME types, looked up by file extension.

pub const TEXT_HTML: &str = "text/html";
pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";

static EXTENSIONS: &[(&str, &str)] = &[
    ("bmp", "image/bmp"),
    ("gif", "image/gif"),
    ("ico", "image/x-icon"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("json", "application/json"),
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("svg", "image/svg+xml"),
    ("webp", "image/webp"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("md", "text/markdown"),
    ("txt", "text/plain"),
    ("htm", TEXT_HTML),
    ("html", TEXT_HTML),
];

/// Content type for a request path, by extension. Paths without an
/// extension default to `application/octet-stream`.
pub fn from_path(path: &str) -> &'static str {
    let last_dot = match path.rfind('.') {
        Some(at) if at + 1 < path.len() => at,
        _ => return APPLICATION_OCTET_STREAM,
    };

    // A dot inside a directory component is not an extension.
    if let Some(last_slash) = path.rfind('/') {
        if last_slash > last_dot {
            return APPLICATION_OCTET_STREAM;
        }
    }

    let extension = &path[last_dot + 1..];
    for (ext, ty) in EXTENSIONS {
        if extension.eq_ignore_ascii_case(ext) {
            return ty;
        }
    }
    APPLICATION_OCTET_STREAM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions() {
        assert_eq!(from_path("/index.html"), "text/html");
        assert_eq!(from_path("/style.CSS"), "text/css");
        assert_eq!(from_path("/img/logo.svg"), "image/svg+xml");
        assert_eq!(from_path("/a.b/photo.jpeg"), "image/jpeg");
    }

    #[test]
    fn unknown_or_missing_extension() {
        assert_eq!(from_path("/binary"), APPLICATION_OCTET_STREAM);
        assert_eq!(from_path("/archive.tar.zst"), APPLICATION_OCTET_STREAM);
        assert_eq!(from_path("/dot.dir/file"), APPLICATION_OCTET_STREAM);
        assert_eq!(from_path("/trailing."), APPLICATION_OCTET_STREAM);
    }
}
