use getset::Getters;
use rand::RngCore;
use serde_json::Value;

use crate::codec::Arguments;
use crate::errors::{GearworkError, Result};

/// Maximum length of a GJS job ID in bytes. The prefix comes first in the
/// assembled string so it survives truncation.
pub const MAX_GJS_ID_BYTES: usize = 256;

/// Render the canonical job key for a `(function_name, args)` pair.
///
/// Keys are sorted lexicographically (the argument map iterates in key
/// order) and values are rendered by a stable scalar printer, so equal
/// dictionaries always produce the same key. Used as the queue-side
/// uniqueness token for functions declared unique.
pub fn canonical_job_key(function_name: &str, args: Option<&Arguments>) -> String {
    let rendered = args
        .map(|map| {
            map.iter()
                .map(|(key, value)| format!("{key}={}", render_value(value)))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    format!("{function_name}({rendered})")
}

/// Stable scalar printer: strings render verbatim, everything else renders
/// as its canonical JSON form (null, booleans, numbers, nested structures).
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A queue-assigned job handle, parsed once and validated.
///
/// Accepts exactly `H:<token>:<digits>` with an optional `<server>//`
/// prefix; any other shape fails with a handle-format error.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct ParsedHandle {
    /// Optional `<server>` routing prefix, without the `//` separator
    server: Option<String>,
    /// The host token between the two colons
    host: String,
    /// The trailing digit run, kept textual to stay faithful to the wire
    sequence: String,
}

impl ParsedHandle {
    pub fn parse(handle: &str) -> Result<Self> {
        let malformed = || GearworkError::HandleFormat(handle.to_string());

        let (server, rest) = match handle.split_once("//") {
            Some((server, rest)) if !server.is_empty() => (Some(server.to_string()), rest),
            Some(_) => return Err(malformed()),
            None => (None, handle),
        };

        let body = rest.strip_prefix("H:").ok_or_else(malformed)?;
        let (host, sequence) = body.rsplit_once(':').ok_or_else(malformed)?;

        if host.is_empty()
            || sequence.is_empty()
            || !sequence.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(malformed());
        }

        Ok(ParsedHandle {
            server,
            host: host.to_string(),
            sequence: sequence.to_string(),
        })
    }

    /// The handle as the queue knows it, without any `<server>//` routing
    /// prefix.
    pub fn raw(&self) -> String {
        format!("H:{}:{}", self.host, self.sequence)
    }

    /// The GJS ID prefix derived from this handle: the handle with its
    /// host segment stripped.
    pub fn gjs_prefix(&self) -> String {
        format!("H:{}", self.sequence)
    }
}

/// A freshly generated 128-bit random prefix rendered as 32 hex characters,
/// for jobs executed locally without a queue handle. `rand::thread_rng` is
/// per-thread, so parallel callers never share RNG state.
pub fn random_prefix() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Assemble a GJS job ID from a prefix and a canonical job key.
///
/// The result is truncated to [`MAX_GJS_ID_BYTES`] and every character
/// outside `[A-Za-z0-9._\-()=,]` is replaced by `_`, so the ID is always
/// safe as a single path segment.
pub fn gjs_job_id(prefix: &str, canonical_key: &str) -> String {
    let assembled = format!("{prefix}.{canonical_key}");
    let mut sanitized: String = assembled
        .chars()
        .map(|c| if is_gjs_char(c) { c } else { '_' })
        .collect();
    sanitized.truncate(MAX_GJS_ID_BYTES);
    sanitized
}

/// Sanitize a function name for use as a log directory segment, using the
/// same alphabet as GJS IDs.
pub fn sanitize_function_name(function_name: &str) -> String {
    function_name
        .chars()
        .map(|c| if is_gjs_char(c) { c } else { '_' })
        .collect()
}

fn is_gjs_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '(' | ')' | '=' | ',')
}
