//! Request-target parsing and decoding.
//!
//! Splits `[scheme://][authority]path[?query][#fragment]`, percent-decodes
//! the path and query, and collapses dot segments. Any `..` surviving the
//! collapse is a directory escape and rejects the target.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Unspecified,
    Http,
    Https,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    Origin,
    Absolute,
    Authority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriError {
    /// Malformed target, bad percent-escape, `%00`, or directory escape.
    BadUri,
    /// The target exceeded the request-line bound.
    TooLong,
}

impl fmt::Display for UriError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UriError::BadUri => "bad URI",
            UriError::TooLong => "URI too long",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: Scheme,
    pub form: Form,
    pub authority: Option<String>,
    /// Always begins with `/`; decoded and normalized.
    pub path: String,
    pub query: Option<String>,
}

impl Uri {
    /// The path without its leading slash, as resolved under the web root.
    pub fn path_relative(&self) -> &str {
        &self.path[1..]
    }

    pub fn parse(raw: &[u8]) -> Result<Uri, UriError> {
        let mut rest = raw;
        let mut scheme = Scheme::Unspecified;
        let mut form = Form::Origin;
        let mut authority = None;

        if let Some(at) = memchr::memmem::find(rest, b"://") {
            form = Form::Absolute;
            scheme = match &rest[..at] {
                s if s.eq_ignore_ascii_case(b"http") => Scheme::Http,
                s if s.eq_ignore_ascii_case(b"https") => Scheme::Https,
                _ => return Err(UriError::BadUri),
            };
            rest = &rest[at + 3..];
        }

        if rest.first() != Some(&b'/') {
            if form != Form::Absolute {
                form = Form::Authority;
            }
            let end = memchr::memchr(b'/', rest).unwrap_or(rest.len());
            let auth = &rest[..end];
            if auth.is_empty() {
                return Err(UriError::BadUri);
            }
            authority = Some(
                std::str::from_utf8(auth)
                    .map_err(|_| UriError::BadUri)?
                    .to_owned(),
            );
            rest = &rest[end..];
        }

        let (raw_path, raw_query) = match memchr::memchr(b'?', rest) {
            Some(at) => {
                let query = &rest[at + 1..];
                // The fragment is not parsed.
                let query = match memchr::memchr(b'#', query) {
                    Some(end) => &query[..end],
                    None => query,
                };
                (&rest[..at], Some(query))
            }
            None => match memchr::memchr(b'#', rest) {
                Some(at) => (&rest[..at], None),
                None => (rest, None),
            },
        };

        if raw_path.is_empty() {
            return Err(UriError::BadUri);
        }
        let decoded = decode(raw_path)?;
        let path = collapse(&decoded)?;

        let query = match raw_query {
            Some(q) => Some(
                String::from_utf8(decode(q)?.into_bytes()).map_err(|_| UriError::BadUri)?,
            ),
            None => None,
        };

        Ok(Uri {
            scheme,
            form,
            authority,
            path,
            query,
        })
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Percent-decodes, rejecting truncated or non-hex escapes and `%00`.
fn decode(raw: &[u8]) -> Result<String, UriError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == 0 {
            return Err(UriError::BadUri);
        }
        if raw[i] != b'%' {
            out.push(raw[i]);
            i += 1;
            continue;
        }
        if raw.len() - i < 3 {
            return Err(UriError::BadUri);
        }
        let hi = hex_value(raw[i + 1]).ok_or(UriError::BadUri)?;
        let lo = hex_value(raw[i + 2]).ok_or(UriError::BadUri)?;
        let byte = hi * 16 + lo;
        if byte == 0 {
            return Err(UriError::BadUri);
        }
        out.push(byte);
        i += 3;
    }
    String::from_utf8(out).map_err(|_| UriError::BadUri)
}

/// Collapses `.` and `..` segments. Anything that would climb above the
/// root is a directory escape.
fn collapse(path: &str) -> Result<String, UriError> {
    if !path.starts_with('/') {
        return Err(UriError::BadUri);
    }

    let trailing_slash = path.len() > 1 && path.ends_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(UriError::BadUri);
                }
            }
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(path.len());
    for segment in &segments {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    } else if trailing_slash {
        out.push('/');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Uri, UriError> {
        Uri::parse(s.as_bytes())
    }

    #[test]
    fn origin_form() {
        let uri = parse("/index.html").unwrap();
        assert_eq!(uri.form, Form::Origin);
        assert_eq!(uri.scheme, Scheme::Unspecified);
        assert_eq!(uri.path, "/index.html");
        assert_eq!(uri.path_relative(), "index.html");
        assert_eq!(uri.query, None);
    }

    #[test]
    fn absolute_form() {
        let uri = parse("http://example.com/a/b?q=1").unwrap();
        assert_eq!(uri.form, Form::Absolute);
        assert_eq!(uri.scheme, Scheme::Http);
        assert_eq!(uri.authority.as_deref(), Some("example.com"));
        assert_eq!(uri.path, "/a/b");
        assert_eq!(uri.query.as_deref(), Some("q=1"));
    }

    #[test]
    fn unknown_scheme_rejected() {
        assert_eq!(parse("ftp://example.com/a"), Err(UriError::BadUri));
    }

    #[test]
    fn dot_segments_collapse() {
        let uri = parse("/a/b/.long/d/.././also_long/./f/../../g").unwrap();
        assert_eq!(uri.path, "/a/b/.long/g");
    }

    #[test]
    fn percent_escapes_decode() {
        let uri = parse("/abc%20xyz%5b").unwrap();
        assert_eq!(uri.path, "/abc xyz[");
    }

    #[test]
    fn escapes_above_root_rejected() {
        assert_eq!(parse("/.."), Err(UriError::BadUri));
        assert_eq!(parse("/../../etc/passwd"), Err(UriError::BadUri));
        assert_eq!(parse("/a/../../etc/passwd"), Err(UriError::BadUri));
        assert_eq!(parse("/%2e%2e/etc/passwd"), Err(UriError::BadUri));
    }

    #[test]
    fn bad_escapes_rejected() {
        assert_eq!(parse("/abc%00"), Err(UriError::BadUri));
        assert_eq!(parse("/abc%ZZ"), Err(UriError::BadUri));
        assert_eq!(parse("/abc%ف"), Err(UriError::BadUri));
        assert_eq!(parse("/abc%4"), Err(UriError::BadUri));
    }

    #[test]
    fn root_and_trailing_slash() {
        assert_eq!(parse("/").unwrap().path, "/");
        assert_eq!(parse("/a/").unwrap().path, "/a/");
        assert_eq!(parse("/a/b/..").unwrap().path, "/a");
        assert_eq!(parse("/./").unwrap().path, "/");
    }

    #[test]
    fn fragment_ignored() {
        let uri = parse("/doc#section").unwrap();
        assert_eq!(uri.path, "/doc");
        let uri = parse("/doc?x=1#section").unwrap();
        assert_eq!(uri.query.as_deref(), Some("x=1"));
    }
}
