//! Wire records for job definitions and results, plus the pluggable codec.
//!
//! Records are maps of short-keyed fields (`f` function, `a` args, `k`
//! kwargs, `t` try, `et` enqueue time, `s` success, `r` result, `st`/`ft`
//! start/finish, `q` queue, `w` worker). The default codec renders them as
//! JSON so records stay readable with redis-cli; a binary codec can be
//! swapped in by implementing [`Codec`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};

/// Wire form of a job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobBlob {
    /// Registered function name
    #[serde(rename = "f")]
    pub function: String,

    /// Positional arguments
    #[serde(rename = "a")]
    pub args: Vec<Value>,

    /// Keyword arguments
    #[serde(rename = "k")]
    pub kwargs: HashMap<String, Value>,

    /// Attempt counter hint, set when a job is re-enqueued
    #[serde(rename = "t")]
    pub job_try: Option<u32>,

    /// Enqueue timestamp, ms since epoch
    #[serde(rename = "et")]
    pub enqueue_time: i64,

    /// Originating queue
    #[serde(rename = "q")]
    pub queue_name: String,
}

/// Wire form of a job result: the definition fields plus the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBlob {
    #[serde(rename = "f")]
    pub function: String,

    #[serde(rename = "a")]
    pub args: Vec<Value>,

    #[serde(rename = "k")]
    pub kwargs: HashMap<String, Value>,

    /// Attempts consumed when the job finalized
    #[serde(rename = "t")]
    pub job_try: u32,

    #[serde(rename = "et")]
    pub enqueue_time: i64,

    /// Whether the function returned normally
    #[serde(rename = "s")]
    pub success: bool,

    /// Return value on success, failure representation otherwise
    #[serde(rename = "r")]
    pub result: Value,

    /// Execution start, ms since epoch
    #[serde(rename = "st")]
    pub start_time: i64,

    /// Execution finish, ms since epoch
    #[serde(rename = "ft")]
    pub finish_time: i64,

    #[serde(rename = "q")]
    pub queue_name: String,

    /// Worker that executed the job
    #[serde(rename = "w")]
    pub worker_name: String,
}

/// Failure kinds stored in the result field of unsuccessful records.
pub const FAILURE_ERROR: &str = "error";
pub const FAILURE_CANCELLED: &str = "cancelled";
pub const FAILURE_TIMEOUT: &str = "timeout";

/// Build the failure representation stored as the result of an
/// unsuccessful job.
pub fn failure_value(kind: &str, message: &str) -> Value {
    serde_json::json!({ "e": kind, "m": message })
}

/// Extract `(kind, message)` from a stored failure representation.
pub fn failure_parts(result: &Value) -> Option<(&str, &str)> {
    let kind = result.get("e")?.as_str()?;
    let message = result.get("m").and_then(Value::as_str).unwrap_or("");
    Some((kind, message))
}

/// Pluggable pair mapping a map of fields to and from bytes.
pub trait Codec: Send + Sync {
    fn encode(&self, fields: &Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Default codec: self-describing JSON text.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, fields: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(fields).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

pub fn serialize_job(codec: &dyn Codec, blob: &JobBlob) -> Result<Vec<u8>> {
    let fields = serde_json::to_value(blob)
        .map_err(|e| Error::Serialization(format!("unable to serialize job \"{}\": {}", blob.function, e)))?;
    codec.encode(&fields)
}

pub fn deserialize_job(codec: &dyn Codec, bytes: &[u8]) -> Result<JobBlob> {
    let fields = codec.decode(bytes)?;
    serde_json::from_value(fields)
        .map_err(|e| Error::Deserialization(format!("unable to deserialize job: {}", e)))
}

/// Serialize a result record. If the user's return value cannot be encoded,
/// the record is replaced with a failure carrying a placeholder so the job
/// still finalizes; `None` is only returned if even that fails.
pub fn serialize_result(codec: &dyn Codec, blob: &ResultBlob) -> Option<Vec<u8>> {
    let attempt = serde_json::to_value(blob)
        .map_err(|e| Error::Serialization(e.to_string()))
        .and_then(|fields| codec.encode(&fields));
    match attempt {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("error serializing result of {}: {}", blob.function, e);
            let mut fallback = blob.clone();
            fallback.success = false;
            fallback.result = failure_value(FAILURE_ERROR, "unable to serialize result");
            serde_json::to_value(&fallback)
                .ok()
                .and_then(|fields| codec.encode(&fields).ok())
        }
    }
}

pub fn deserialize_result(codec: &dyn Codec, bytes: &[u8]) -> Result<ResultBlob> {
    let fields = codec.decode(bytes)?;
    serde_json::from_value(fields)
        .map_err(|e| Error::Deserialization(format!("unable to deserialize job result: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> JobBlob {
        JobBlob {
            function: "say_hi".to_string(),
            args: vec![json!("wutong")],
            kwargs: HashMap::from([("volume".to_string(), json!(3))]),
            job_try: None,
            enqueue_time: 1_700_000_000_000,
            queue_name: "rqueue:queue".to_string(),
        }
    }

    #[test]
    fn test_job_round_trip() {
        let codec = JsonCodec;
        let blob = sample_job();
        let bytes = serialize_job(&codec, &blob).unwrap();
        let decoded = deserialize_job(&codec, &bytes).unwrap();
        assert_eq!(decoded, blob);
    }

    #[test]
    fn test_job_wire_field_names() {
        let codec = JsonCodec;
        let bytes = serialize_job(&codec, &sample_job()).unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["f"], json!("say_hi"));
        assert_eq!(raw["q"], json!("rqueue:queue"));
        assert_eq!(raw["et"], json!(1_700_000_000_000i64));
    }

    #[test]
    fn test_result_round_trip() {
        let codec = JsonCodec;
        let blob = ResultBlob {
            function: "say_hi".to_string(),
            args: vec![],
            kwargs: HashMap::new(),
            job_try: 2,
            enqueue_time: 1000,
            success: true,
            result: json!({"ok": true}),
            start_time: 2000,
            finish_time: 3000,
            queue_name: "rqueue:queue".to_string(),
            worker_name: "w1".to_string(),
        };
        let bytes = serialize_result(&codec, &blob).unwrap();
        let decoded = deserialize_result(&codec, &bytes).unwrap();
        assert_eq!(decoded, blob);
    }

    #[test]
    fn test_decode_garbage_is_an_error() {
        let codec = JsonCodec;
        assert!(matches!(
            deserialize_job(&codec, b"not json"),
            Err(Error::Deserialization(_))
        ));
        assert!(matches!(
            deserialize_result(&codec, b"{\"f\": 1}"),
            Err(Error::Deserialization(_))
        ));
    }

    #[test]
    fn test_failure_representation() {
        let value = failure_value(FAILURE_CANCELLED, "aborted by client");
        let (kind, message) = failure_parts(&value).unwrap();
        assert_eq!(kind, FAILURE_CANCELLED);
        assert_eq!(message, "aborted by client");

        assert!(failure_parts(&json!("plain value")).is_none());
        assert!(failure_parts(&json!({"m": "no kind"})).is_none());
    }
}
