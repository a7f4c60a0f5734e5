//! JSON Pointer and `$ref` string algebra.
//!
//! Everything here is pure: no I/O, no document access. The bundler, the resolver
//! and the chunk exporter all build their paths through these helpers so that the
//! escaping rules live in exactly one place.

use std::path::{Component, Path, PathBuf};

use crate::error::ReferenceError;
use crate::resolver::LocationMap;

/// Escape a single key for use as a JSON Pointer segment (RFC 6901).
///
/// `~` must be escaped before `/`, otherwise the `~` introduced by `~1` would be
/// escaped a second time.
pub fn escape(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Reverse of [`escape`].
pub fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Split a reference on the first `#` into `(base, fragment)`.
///
/// The fragment is returned without the `#`. A reference without `#` has an
/// empty fragment.
pub fn split_ref(reference: &str) -> (&str, &str) {
    match reference.find('#') {
        Some(idx) => (&reference[..idx], &reference[idx + 1..]),
        None => (reference, ""),
    }
}

/// Parse a pointer into unescaped segments.
///
/// Accepts `#/a/b`, `/a/b` and `a/b`. The empty pointer (and `#`) yields no
/// segments.
pub fn parse_pointer(pointer: &str) -> Vec<String> {
    let path = pointer.strip_prefix('#').unwrap_or(pointer);
    let path = path.strip_prefix('/').unwrap_or(path);
    if path.is_empty() {
        return Vec::new();
    }
    path.split('/').map(unescape).collect()
}

/// Build a `/`-prefixed pointer from raw (unescaped) segments.
pub fn to_pointer<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(|s| format!("/{}", escape(s.as_ref())))
        .collect()
}

/// Append a `/`-prefixed fragment to a location-map path.
///
/// Location-map paths carry no leading `/` for documents indexed at the root,
/// so an empty base drops the fragment's leading `/` as well.
pub fn join_pointer(base: &str, fragment: &str) -> String {
    if base.is_empty() {
        fragment.strip_prefix('/').unwrap_or(fragment).to_string()
    } else {
        format!("{}{}", base, fragment)
    }
}

/// Whether a reference points into the current document.
pub fn is_local_ref(reference: &str) -> bool {
    reference.starts_with('#')
}

/// Check if a string looks like a URL (starts with http:// or https://).
pub fn is_remote_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Rewrite a local reference so it points below `prefix`.
///
/// `prefix_internal_ref("#/a/b", "#/x-ext/abc")` gives `#/x-ext/abc/a/b`.
pub fn prefix_internal_ref(reference: &str, prefix: &str) -> Result<String, ReferenceError> {
    if !is_local_ref(reference) {
        return Err(ReferenceError::NotLocal {
            reference: reference.to_string(),
        });
    }
    let (_, fragment) = split_ref(reference);
    Ok(format!("{}{}", prefix, fragment))
}

/// Resolve a reference location against the document it appears in.
///
/// Absolute URLs are returned unchanged. Relative references inherit the
/// origin's scheme and host when the origin is a URL, or the origin's directory
/// when it is a file path. Without an origin the reference is taken as-is.
pub fn resolve_reference_path(origin: Option<&str>, reference: &str) -> String {
    if is_remote_url(reference) {
        return reference.to_string();
    }

    match origin {
        Some(origin) if is_remote_url(origin) => url::Url::parse(origin)
            .and_then(|base| base.join(reference))
            .map(|joined| joined.to_string())
            .unwrap_or_else(|_| reference.to_string()),
        Some(origin) => {
            let target = Path::new(reference);
            if target.is_absolute() {
                return normalize_path(target);
            }
            let dir = Path::new(origin).parent().unwrap_or(Path::new(""));
            normalize_path(&dir.join(target))
        }
        None => reference.to_string(),
    }
}

/// Lexically collapse `.` and `..` components.
fn normalize_path(path: &Path) -> String {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out.to_string_lossy().into_owned()
}

/// Canonicalize a reference to a local path (without leading `/`).
///
/// `context` is the nearest enclosing `$id` of the node holding the reference.
/// Every failure is deterministic: an empty reference, a base URI that was never
/// indexed, or an anchor missing from the location map.
pub fn canonicalize(
    reference: &str,
    context: &str,
    locations: &LocationMap,
) -> Result<String, ReferenceError> {
    let (base, fragment) = split_ref(reference);

    if base.is_empty() {
        if fragment.is_empty() {
            return Err(ReferenceError::EmptyReference);
        }
        if fragment.starts_with('/') {
            return Ok(fragment[1..].to_string());
        }
        let key = format!("{}#{}", context, fragment);
        return locations
            .get(&key)
            .map(str::to_string)
            .ok_or_else(|| ReferenceError::UnknownAnchor {
                reference: reference.to_string(),
            });
    }

    let mapped = locations
        .get(base)
        .ok_or_else(|| ReferenceError::UnknownExternalReference {
            reference: reference.to_string(),
        })?;

    if fragment.is_empty() {
        return Ok(mapped.to_string());
    }
    if fragment.starts_with('/') {
        return Ok(join_pointer(mapped, fragment));
    }

    locations
        .get(&format!("{}#{}", base, fragment))
        .map(str::to_string)
        .ok_or_else(|| ReferenceError::UnknownAnchor {
            reference: reference.to_string(),
        })
}
