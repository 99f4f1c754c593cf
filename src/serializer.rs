//! Durable byte encoding for records and sessions
//!
//! Records are JSON, optionally gzip-compressed. Compressed payloads are
//! recognized by the gzip magic bytes, so a store can hold a mix of both
//! (e.g. after toggling compression) and still be read back.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::io::{Read, Write};

use crate::config::StorageConfig;
use crate::error::{DebugError, Result};
use crate::record::RequestRecord;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone)]
pub struct RecordSerializer {
    compression: bool,
    compression_level: u32,
    validate_on_read: bool,
}

impl RecordSerializer {
    pub fn new(compression: bool, compression_level: u32, validate_on_read: bool) -> Self {
        Self {
            compression,
            compression_level: compression_level.min(9),
            validate_on_read,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            config.compression,
            config.compression_level,
            config.validate_on_read,
        )
    }

    pub fn is_compressed(bytes: &[u8]) -> bool {
        bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC
    }

    /// Encode a value, compressing it when compression is enabled
    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(value)?;
        if !self.compression {
            return Ok(json);
        }

        let mut encoder = GzEncoder::new(
            Vec::with_capacity(json.len() / 4),
            Compression::new(self.compression_level),
        );
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    /// Decode any serializable value (no structural validation)
    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let json = Self::decompress(bytes)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Decode a request record, validating its structure when configured
    pub fn deserialize_record(&self, bytes: &[u8]) -> Result<RequestRecord> {
        let json = Self::decompress(bytes)?;
        let value: Value = serde_json::from_slice(&json)
            .map_err(|e| DebugError::Validation(format!("record is not valid JSON: {}", e)))?;

        if self.validate_on_read {
            validate_record_structure(&value)?;
        }

        serde_json::from_value(value)
            .map_err(|e| DebugError::Validation(format!("record does not match schema: {}", e)))
    }

    fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
        if !Self::is_compressed(bytes) {
            return Ok(bytes.to_vec());
        }

        let mut decoder = GzDecoder::new(bytes);
        let mut out = Vec::with_capacity(bytes.len() * 4);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| DebugError::Validation(format!("corrupt compressed record: {}", e)))?;
        Ok(out)
    }
}

/// Structural integrity check for a stored record
///
/// Verifies the fields every consumer relies on are present and typed
/// correctly; unknown extra fields are allowed.
pub fn validate_record_structure(value: &Value) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| DebugError::Validation("record is not an object".to_string()))?;

    for field in ["requestId", "sessionId"] {
        require(obj.get(field).map_or(false, Value::is_string), field, "string")?;
    }
    for field in ["timestamp", "port"] {
        require(obj.get(field).map_or(false, Value::is_u64), field, "unsigned integer")?;
    }

    let request = obj
        .get("request")
        .and_then(Value::as_object)
        .ok_or_else(|| DebugError::Validation("field 'request' must be an object".to_string()))?;
    for field in ["method", "url"] {
        require(
            request.get(field).map_or(false, Value::is_string),
            &format!("request.{}", field),
            "string",
        )?;
    }

    if let Some(response) = obj.get("response") {
        require(
            response.get("status").map_or(false, Value::is_u64),
            "response.status",
            "unsigned integer",
        )?;
    }

    let pipeline = obj
        .get("pipeline")
        .and_then(Value::as_object)
        .ok_or_else(|| DebugError::Validation("field 'pipeline' must be an object".to_string()))?;
    let modules = pipeline
        .get("modules")
        .and_then(Value::as_array)
        .ok_or_else(|| DebugError::Validation("field 'pipeline.modules' must be an array".to_string()))?;

    for (i, module) in modules.iter().enumerate() {
        require(
            module.get("moduleName").map_or(false, Value::is_string),
            &format!("pipeline.modules[{}].moduleName", i),
            "string",
        )?;
        require(
            module.get("startTime").map_or(false, Value::is_u64),
            &format!("pipeline.modules[{}].startTime", i),
            "unsigned integer",
        )?;
    }

    Ok(())
}

fn require(ok: bool, field: &str, expected: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(DebugError::Validation(format!(
            "field '{}' missing or not a {}",
            field, expected
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::sample_record;
    use serde_json::json;

    #[test]
    fn test_round_trip_uncompressed() {
        let serializer = RecordSerializer::new(false, 6, true);
        let record = sample_record("req-1", 8080, "s1");

        let bytes = serializer.serialize(&record).unwrap();
        assert!(!RecordSerializer::is_compressed(&bytes));

        let decoded = serializer.deserialize_record(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_round_trip_compressed() {
        let serializer = RecordSerializer::new(true, 9, true);
        let record = sample_record("req-2", 8080, "s1");

        let bytes = serializer.serialize(&record).unwrap();
        assert!(RecordSerializer::is_compressed(&bytes));

        let decoded = serializer.deserialize_record(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_null_module_output_survives_round_trip() {
        let serializer = RecordSerializer::new(false, 6, true);
        let mut record = sample_record("req-null", 8080, "s1");
        record.pipeline.modules[0].output = Some(Value::Null);
        record.pipeline.modules[1].output = None;

        let bytes = serializer.serialize(&record).unwrap();
        let decoded = serializer.deserialize_record(&bytes).unwrap();

        assert_eq!(decoded.pipeline.modules[0].output, Some(Value::Null));
        assert_eq!(decoded.pipeline.modules[1].output, None);
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_reads_uncompressed_with_compressing_serializer() {
        let plain = RecordSerializer::new(false, 6, true);
        let gz = RecordSerializer::new(true, 6, true);
        let record = sample_record("req-3", 9000, "s2");

        let bytes = plain.serialize(&record).unwrap();
        assert_eq!(gz.deserialize_record(&bytes).unwrap(), record);
    }

    #[test]
    fn test_integrity_error_on_missing_fields() {
        let serializer = RecordSerializer::new(false, 6, true);
        let bytes = serde_json::to_vec(&json!({
            "requestId": "req-1",
            "sessionId": "s1",
            "timestamp": 1,
            "port": 8080,
            "request": {"method": "POST"},
            "pipeline": {"id": "p", "provider": "x", "model": "m", "modules": []}
        }))
        .unwrap();

        let err = serializer.deserialize_record(&bytes).unwrap_err();
        assert!(matches!(err, DebugError::Validation(_)));
        assert!(err.to_string().contains("request.url"));
    }

    #[test]
    fn test_corrupt_gzip_is_validation_error() {
        let serializer = RecordSerializer::new(true, 6, true);
        let mut bytes = serializer.serialize(&sample_record("req-1", 8080, "s1")).unwrap();
        bytes.truncate(bytes.len() / 2);

        let err = serializer.deserialize_record(&bytes).unwrap_err();
        assert!(matches!(err, DebugError::Validation(_)));
    }

    #[test]
    fn test_validation_can_be_disabled() {
        let record = sample_record("req-1", 8080, "s1");
        let mut value = serde_json::to_value(&record).unwrap();
        value["pipeline"]["modules"][0]["startTime"] = json!(-5);
        let bytes = serde_json::to_vec(&value).unwrap();

        let strict = RecordSerializer::new(false, 6, true);
        assert!(strict.deserialize_record(&bytes).is_err());

        // Without the structural pass the schema mismatch still surfaces, but as the same error kind
        let lax = RecordSerializer::new(false, 6, false);
        assert!(matches!(
            lax.deserialize_record(&bytes).unwrap_err(),
            DebugError::Validation(_)
        ));
    }
}
