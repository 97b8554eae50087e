//! Canonical name handling.
//!
//! Canonical names are `\`-separated absolute paths (`\dir\file`). When the
//! volume enables named streams, the final component may carry a `:`-separated
//! stream suffix (`\dir\file:stream`); the part before the `:` names the
//! stream's *main file*. The transport is expected to hand the engine names
//! already normalized to this shape; the engine validates but never rewrites
//! separators.

use std::borrow::Cow;

use memchr::memchr;
use memchr::memrchr;

use crate::FsError;
use crate::FsResult;

/// Path separator.
pub const SEPARATOR: char = '\\';
/// Stream-name separator.
pub const STREAM_SEPARATOR: char = ':';

/// The canonical root name.
pub const ROOT: &str = "\\";

/// Validate a canonical name against volume policy.
///
/// `named_streams` gates the `:` separator; `max_component_length` bounds
/// each `\`-separated component (a stream suffix counts toward its
/// component).
pub fn validate(name: &str, named_streams: bool, max_component_length: usize) -> FsResult<()> {
    let bytes = name.as_bytes();
    if bytes.first() != Some(&b'\\') {
        return Err(FsError::InvalidName);
    }
    if name == ROOT {
        return Ok(());
    }
    if bytes.last() == Some(&b'\\') {
        return Err(FsError::InvalidName);
    }

    let mut seen_stream = false;
    for component in name[1..].split(SEPARATOR) {
        if seen_stream {
            // a stream suffix must be on the final component
            return Err(FsError::InvalidName);
        }
        if component.is_empty() || component == "." || component == ".." {
            return Err(FsError::InvalidName);
        }
        if component.len() > max_component_length {
            return Err(FsError::InvalidName);
        }
        if let Some(colon) = memchr(b':', component.as_bytes()) {
            if !named_streams {
                return Err(FsError::InvalidName);
            }
            let (main_part, stream_part) = component.split_at(colon);
            let stream_part = &stream_part[1..];
            if main_part.is_empty()
                || stream_part.is_empty()
                || memchr(b':', stream_part.as_bytes()).is_some()
            {
                return Err(FsError::InvalidName);
            }
            seen_stream = true;
        }
    }

    Ok(())
}

/// Fold a name for table lookup under the volume's case policy.
#[must_use]
pub fn fold(name: &str, case_sensitive: bool) -> Cow<'_, str> {
    if case_sensitive || name.chars().all(|c| !c.is_lowercase()) {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(name.to_uppercase())
    }
}

/// Split a name into its parent directory and final suffix.
///
/// `\dir\file` becomes `("\dir", "file")`, `\file` becomes `("\", "file")`,
/// and the root splits into `("\", "")`. Stream suffixes stay attached to
/// the final component: `\file:s` becomes `("\", "file:s")`.
#[must_use]
pub fn split_parent(name: &str) -> (&str, &str) {
    match memrchr(b'\\', name.as_bytes()) {
        Some(0) => (ROOT, &name[1..]),
        Some(pos) => (&name[..pos], &name[pos + 1..]),
        None => (ROOT, name),
    }
}

/// Byte offset of the final suffix within `name`; the notify fan-out wants
/// the offset rather than the split.
#[must_use]
pub fn suffix_offset(name: &str) -> usize {
    match memrchr(b'\\', name.as_bytes()) {
        Some(pos) => pos + 1,
        None => 0,
    }
}

/// Split a name at the stream separator: `\a\f:s` becomes `("\a\f",
/// Some("s"))`, `\a\f` becomes `("\a\f", None)`.
#[must_use]
pub fn split_stream(name: &str) -> (&str, Option<&str>) {
    match memchr(b':', name.as_bytes()) {
        Some(pos) => (&name[..pos], Some(&name[pos + 1..])),
        None => (name, None),
    }
}

/// Does `name` denote a stream (contains a stream separator)?
#[must_use]
pub fn is_stream_name(name: &str) -> bool {
    memchr(b':', name.as_bytes()).is_some()
}

/// Is `name` a *path* descendant of `ancestor` — that is, below it in the
/// directory hierarchy? Stream children (`\a:s` under `\a`) do not count;
/// see [`is_stream_descendant`]. Both names must be folded consistently.
#[must_use]
pub fn is_path_descendant(ancestor: &str, name: &str) -> bool {
    if ancestor == ROOT {
        return name.len() > 1 && name.starts_with(SEPARATOR);
    }
    name.len() > ancestor.len()
        && name.as_bytes()[ancestor.len()] == b'\\'
        && name.starts_with(ancestor)
}

/// Is `name` a stream of exactly `main` (`\a:s` under `\a`)?
#[must_use]
pub fn is_stream_descendant(main: &str, name: &str) -> bool {
    name.len() > main.len()
        && name.as_bytes()[main.len()] == b':'
        && name.starts_with(main)
}

/// Rewrite the leading `old_prefix_len` bytes of `name` with `new_prefix`,
/// preserving the remainder; the rename fan-out applies this to every
/// descendant.
#[must_use]
pub fn replace_prefix(name: &str, old_prefix_len: usize, new_prefix: &str) -> String {
    let mut out = String::with_capacity(new_prefix.len() + name.len() - old_prefix_len);
    out.push_str(new_prefix);
    out.push_str(&name[old_prefix_len..]);
    out
}
