//! Object path syntax checks and the percent-style segment codec used to
//! embed opaque external identifiers in object paths.

use crate::error::{Error, Result};

/// Path syntax per the wire spec: `/` or `/`-separated non-empty segments of
/// `[A-Za-z0-9_]`, no trailing slash.
pub fn object_path_is_valid(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    path[1..].split('/').all(|segment| {
        !segment.is_empty()
            && segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

/// Escapes `external` into one path segment under `prefix`. Alphanumeric
/// bytes pass through, everything else becomes `_xx` lowercase hex, and an
/// empty identifier becomes `_` so the result is always a valid path.
pub fn encode_object_path(prefix: &str, external: &str) -> Result<String> {
    if !object_path_is_valid(prefix) {
        return Err(Error::InvalidPath(prefix.to_owned()));
    }
    let mut segment = String::new();
    if external.is_empty() {
        segment.push('_');
    } else {
        for b in external.bytes() {
            if b.is_ascii_alphanumeric() {
                segment.push(b as char);
            } else {
                segment.push_str(&format!("_{:02x}", b));
            }
        }
    }
    if prefix == "/" {
        Ok(format!("/{}", segment))
    } else {
        Ok(format!("{}/{}", prefix, segment))
    }
}

/// Inverts [`encode_object_path`]. Returns an empty string when `full_path`
/// is not a single segment under `prefix`.
pub fn decode_object_path(prefix: &str, full_path: &str) -> Result<String> {
    if !object_path_is_valid(prefix) {
        return Err(Error::InvalidPath(prefix.to_owned()));
    }
    if !object_path_is_valid(full_path) {
        return Err(Error::InvalidPath(full_path.to_owned()));
    }
    let segment = match strip_path_prefix(prefix, full_path) {
        Some(segment) if !segment.is_empty() && !segment.contains('/') => segment,
        _ => return Ok(String::new()),
    };
    if segment == "_" {
        return Ok(String::new());
    }
    let bytes = segment.as_bytes();
    let mut external = Vec::new();
    let mut ix = 0;
    while ix < bytes.len() {
        if bytes[ix] == b'_' {
            if ix + 2 >= bytes.len() {
                return Err(Error::InvalidPath(full_path.to_owned()));
            }
            let hex = std::str::from_utf8(&bytes[ix + 1..ix + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| Error::InvalidPath(full_path.to_owned()))?;
            external.push(hex);
            ix += 3;
        } else {
            external.push(bytes[ix]);
            ix += 1;
        }
    }
    String::from_utf8(external).map_err(|_| Error::InvalidPath(full_path.to_owned()))
}

fn strip_path_prefix<'a>(prefix: &str, full_path: &'a str) -> Option<&'a str> {
    if prefix == "/" {
        return full_path.strip_prefix('/');
    }
    full_path
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_syntax() {
        assert!(object_path_is_valid("/"));
        assert!(object_path_is_valid("/org/freedesktop/DBus"));
        assert!(object_path_is_valid("/a_b/c1"));
        assert!(!object_path_is_valid(""));
        assert!(!object_path_is_valid("org/example"));
        assert!(!object_path_is_valid("/org//example"));
        assert!(!object_path_is_valid("/org/example/"));
        assert!(!object_path_is_valid("/org/exa-mple"));
    }

    #[test]
    fn encode_escapes_non_alphanumerics() {
        assert_eq!(
            encode_object_path("/block", "sda1").unwrap(),
            "/block/sda1"
        );
        assert_eq!(
            encode_object_path("/block", "dm-0").unwrap(),
            "/block/dm_2d0"
        );
        assert_eq!(encode_object_path("/", "").unwrap(), "/_");
        assert!(matches!(
            encode_object_path("not/a/path", "x"),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn decode_inverts_encode() {
        for external in ["sda1", "dm-0", "with space", "_underscore_", ""] {
            let path = encode_object_path("/block", external).unwrap();
            assert_eq!(decode_object_path("/block", &path).unwrap(), external);
        }
    }

    #[test]
    fn decode_outside_prefix_is_empty() {
        assert_eq!(decode_object_path("/block", "/other/sda1").unwrap(), "");
        assert_eq!(decode_object_path("/block", "/block").unwrap(), "");
        assert_eq!(
            decode_object_path("/block", "/block/a/b").unwrap(),
            ""
        );
    }
}
