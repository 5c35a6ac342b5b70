use serde_json::{Map, Value};

use crate::errors::{GearworkError, Result};

/// Version byte prepended to every encoded payload. Nothing outside this
/// library reads the wire format; bump the version on incompatible changes.
const FORMAT_VERSION: u8 = 0x01;

/// Argument dictionaries and results are string-keyed JSON-representable
/// maps. `serde_json` is built with default features, so the map is a
/// `BTreeMap` underneath and serializes with sorted keys — encoding equal
/// dictionaries always yields byte-identical output.
pub type Arguments = Map<String, Value>;

/// Encode an argument dictionary for the queue.
///
/// `None` encodes to the empty byte string. Encoding verifies its own
/// round-trip (`decode(encode(x)) == x`) and fails fast with a codec error
/// on any divergence, so unserializable payloads never reach the queue.
pub fn encode(args: Option<&Arguments>) -> Result<Vec<u8>> {
    let Some(map) = args else {
        return Ok(Vec::new());
    };

    let mut bytes = Vec::with_capacity(64);
    bytes.push(FORMAT_VERSION);
    serde_json::to_writer(&mut bytes, &Value::Object(map.clone()))
        .map_err(|e| GearworkError::Codec(format!("failed to serialize payload: {e}")))?;

    let round_trip = decode(&bytes)?;
    if round_trip.as_ref() != Some(map) {
        return Err(GearworkError::Codec(
            "round-trip verification diverged from input".into(),
        ));
    }

    Ok(bytes)
}

/// Decode bytes produced by [`encode`]. The empty byte string decodes to
/// `None`.
pub fn decode(bytes: &[u8]) -> Result<Option<Arguments>> {
    let Some((&version, body)) = bytes.split_first() else {
        return Ok(None);
    };

    if version != FORMAT_VERSION {
        return Err(GearworkError::Codec(format!(
            "unsupported payload version {version:#04x}"
        )));
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| GearworkError::Codec(format!("failed to deserialize payload: {e}")))?;

    match value {
        Value::Object(map) => Ok(Some(map)),
        other => Err(GearworkError::Codec(format!(
            "payload is not a dictionary: {other}"
        ))),
    }
}

/// Wrap a job result as `{ "result": value }` and encode it.
///
/// The wrapper keeps a `null` result distinguishable from "no result";
/// every reply handed to the queue goes through this, null included.
pub fn encode_result(value: &Value) -> Result<Vec<u8>> {
    let mut wrapper = Arguments::new();
    wrapper.insert("result".into(), value.clone());
    encode(Some(&wrapper))
}

/// Decode bytes produced by [`encode_result`] and unwrap the inner value.
pub fn decode_result(bytes: &[u8]) -> Result<Value> {
    let mut map = decode(bytes)?
        .ok_or_else(|| GearworkError::Codec("result payload is empty".into()))?;

    map.remove("result")
        .ok_or_else(|| GearworkError::Codec("result payload is missing the result key".into()))
}
