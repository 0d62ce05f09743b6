//! Cached clock-derived header values.
//!
//! The `Date` header is rendered at most once per couple of seconds; the
//! `Last-Modified` value is cached in a small mtime-bucketed table since
//! most traffic hits a handful of files.

use std::cell::RefCell;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::buffer::Buffer;

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

/// Refresh the cached Date when it is stale by more than this.
const DATE_STALE: Duration = Duration::from_secs(2);

const LAST_MODIFIED_BUCKETS: usize = 8;

struct CachedDate {
    bytes: [u8; DATE_VALUE_LENGTH],
    rendered_at: Option<SystemTime>,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate {
    bytes: [0; DATE_VALUE_LENGTH],
    rendered_at: None,
}));

thread_local!(static LAST_MODIFIED: RefCell<[Option<(i64, [u8; DATE_VALUE_LENGTH])>; LAST_MODIFIED_BUCKETS]> =
    RefCell::new([None; LAST_MODIFIED_BUCKETS]));

impl CachedDate {
    fn check(&mut self) {
        let now = SystemTime::now();
        let stale = match self.rendered_at {
            None => true,
            Some(at) => now.duration_since(at).map_or(true, |age| age > DATE_STALE),
        };
        if stale {
            render(now, &mut self.bytes);
            self.rendered_at = Some(now);
        }
    }
}

fn render(time: SystemTime, dst: &mut [u8; DATE_VALUE_LENGTH]) {
    let formatted = httpdate::fmt_http_date(time);
    debug_assert_eq!(formatted.len(), DATE_VALUE_LENGTH);
    dst.copy_from_slice(formatted.as_bytes());
}

/// Appends the current RFC 7231 date value to `dst`.
pub(crate) fn extend(dst: &mut Buffer) -> bool {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.check();
        dst.extend_from_slice(&cache.bytes)
    })
}

/// Appends the RFC 7231 rendering of `mtime` (seconds since the epoch) to
/// `dst`, via the bucketed cache.
pub(crate) fn extend_last_modified(mtime: i64, dst: &mut Buffer) -> bool {
    LAST_MODIFIED.with(|cache| {
        let mut cache = cache.borrow_mut();
        let bucket = (mtime.rem_euclid(LAST_MODIFIED_BUCKETS as i64)) as usize;
        match cache[bucket] {
            Some((cached_mtime, ref bytes)) if cached_mtime == mtime => {
                dst.extend_from_slice(bytes)
            }
            _ => {
                let time = if mtime >= 0 {
                    UNIX_EPOCH + Duration::from_secs(mtime as u64)
                } else {
                    UNIX_EPOCH
                };
                let mut bytes = [0; DATE_VALUE_LENGTH];
                render(time, &mut bytes);
                cache[bucket] = Some((mtime, bytes));
                dst.extend_from_slice(&bytes)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_value_length_matches() {
        assert_eq!(DATE_VALUE_LENGTH, "Sun, 06 Nov 1994 08:49:37 GMT".len());
    }

    #[test]
    fn date_is_valid_and_stable() {
        let mut a = Buffer::new(64, 64);
        let mut b = Buffer::new(64, 64);
        assert!(extend(&mut a));
        assert!(extend(&mut b));
        assert_eq!(a.readable(), b.readable());
        assert!(a.readable().ends_with(b" GMT"));
    }

    #[test]
    fn last_modified_renders_epoch_offsets() {
        let mut buf = Buffer::new(64, 64);
        assert!(extend_last_modified(784111777, &mut buf));
        assert_eq!(buf.readable(), b"Sun, 06 Nov 1994 08:49:37 GMT");

        // A second hit comes from the cache and matches.
        let mut again = Buffer::new(64, 64);
        assert!(extend_last_modified(784111777, &mut again));
        assert_eq!(again.readable(), buf.readable());
    }
}
