//! CBOR encoding for wire messages.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeDraft, ChangeId, Document, PrincipalId, SyncableRecord};
    use serde_json::json;

    #[test]
    fn record_survives_cbor() {
        let data = json!({"name": "X", "tags": ["a", "b"], "score": 1.5, "n": -3})
            .as_object()
            .cloned()
            .unwrap();
        let record = SyncableRecord::new("notes", "n1", PrincipalId::new("u"), data, 100);

        let bytes = to_cbor(&record).unwrap();
        let decoded: SyncableRecord = from_cbor(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn delete_change_without_payload() {
        let change = ChangeDraft::delete("notes", "n1", 7).into_change(ChangeId(9), 11);
        let decoded: crate::Change = from_cbor(&to_cbor(&change).unwrap()).unwrap();
        assert_eq!(decoded.payload, None::<Document>);
        assert_eq!(decoded.id, ChangeId(9));
    }

    #[test]
    fn garbage_is_rejected() {
        let result: CodecResult<SyncableRecord> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
