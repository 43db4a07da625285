//! Index event records and their compact binary encoding.

use crate::error::{IndexError, Result};

/// Nature of the row mutation carried by an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Upsert,
    Delete,
}

impl EventKind {
    fn to_u8(self) -> u8 {
        match self {
            EventKind::Upsert => 1,
            EventKind::Delete => 2,
        }
    }

    fn from_u8(raw: u8) -> anyhow::Result<Self> {
        match raw {
            1 => Ok(EventKind::Upsert),
            2 => Ok(EventKind::Delete),
            other => anyhow::bail!("unknown event kind {other}"),
        }
    }
}

/// One row mutation waiting to be applied to the registered indexes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    kind: EventKind,
    key: Vec<u8>,
    payload: Vec<u8>,
    source: Option<String>,
}

impl EventRecord {
    /// Build a record, rejecting empty keys and fields too large to frame.
    pub fn new(
        kind: EventKind,
        key: impl Into<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let key = key.into();
        let payload = payload.into();
        if key.is_empty() {
            return Err(IndexError::invalid("event key must not be empty"));
        }
        check_len("key", key.len())?;
        check_len("payload", payload.len())?;
        Ok(Self {
            kind,
            key,
            payload,
            source: None,
        })
    }

    /// Insert-or-update of `key` with the new row `payload`.
    pub fn upsert(key: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Result<Self> {
        Self::new(EventKind::Upsert, key, payload)
    }

    /// Removal of `key`; carries no payload.
    pub fn delete(key: impl Into<Vec<u8>>) -> Result<Self> {
        Self::new(EventKind::Delete, key, Vec::<u8>::new())
    }

    /// Tag the record with the table it originated from.
    pub fn with_source(mut self, source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        check_len("source", source.len())?;
        self.source = Some(source);
        Ok(self)
    }

    /// Upsert or delete.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Primary key of the mutated row.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Row image after the mutation; empty for deletes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Source table, if the publisher tagged one.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Encode into the queue record payload.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.kind.to_u8());
        match &self.source {
            Some(source) => {
                out.push(1);
                out.extend_from_slice(&(source.len() as u32).to_be_bytes());
                out.extend_from_slice(source.as_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Return the encoded size for this record.
    pub(crate) fn encoded_len(&self) -> usize {
        let source = self.source.as_ref().map(|s| 4 + s.len()).unwrap_or(0);
        1 + 1 + source + 4 + self.key.len() + 4 + self.payload.len()
    }

    /// Decode a record from a queue record payload.
    pub(crate) fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let kind = EventKind::from_u8(read_u8_at(buf, &mut offset)?)?;
        let source = match read_u8_at(buf, &mut offset)? {
            0 => None,
            1 => {
                let raw = read_bytes_at(buf, &mut offset)?;
                let source = String::from_utf8(raw)
                    .map_err(|_| anyhow::anyhow!("event source is not utf-8"))?;
                Some(source)
            }
            other => anyhow::bail!("invalid event source flag {other}"),
        };
        let key = read_bytes_at(buf, &mut offset)?;
        anyhow::ensure!(!key.is_empty(), "event record has empty key");
        let payload = read_bytes_at(buf, &mut offset)?;
        anyhow::ensure!(offset == buf.len(), "event record has trailing bytes");
        Ok(Self {
            kind,
            key,
            payload,
            source,
        })
    }
}

/// Reject fields whose length does not fit the `u32` prefix.
fn check_len(field: &str, len: usize) -> Result<()> {
    if u32::try_from(len).is_err() {
        return Err(IndexError::invalid(format!(
            "event {field} is {len} bytes, larger than a record can frame"
        )));
    }
    Ok(())
}

/// Read one byte and advance `offset`.
fn read_u8_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset < data.len(), "event record short u8");
    let value = data[*offset];
    *offset += 1;
    Ok(value)
}

/// Read a u32 length prefix followed by that many bytes.
fn read_bytes_at(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(*offset + 4 <= data.len(), "event record short length");
    let mut len_buf = [0u8; 4];
    len_buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    let len = u32::from_be_bytes(len_buf) as usize;
    anyhow::ensure!(*offset + len <= data.len(), "event record short field");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_rejected() {
        let err = EventRecord::upsert(Vec::<u8>::new(), b"p".to_vec()).unwrap_err();
        assert!(matches!(err, IndexError::InvalidArgument(_)));
    }

    #[test]
    fn sourced_delete_survives_encoding() {
        let record = EventRecord::delete(b"rowA".to_vec())
            .unwrap()
            .with_source("users")
            .unwrap();
        let encoded = record.encode();
        assert_eq!(encoded.len(), record.encoded_len());
        let decoded = EventRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.kind(), EventKind::Delete);
        assert_eq!(decoded.source(), Some("users"));
        assert!(decoded.payload().is_empty());
    }

    #[test]
    fn decode_rejects_garbage() {
        let record = EventRecord::upsert(b"k".to_vec(), b"value".to_vec()).unwrap();
        let encoded = record.encode();
        assert!(EventRecord::decode(&encoded[..encoded.len() - 1]).is_err());

        let mut bad_kind = encoded.clone();
        bad_kind[0] = 9;
        assert!(EventRecord::decode(&bad_kind).is_err());

        let mut trailing = encoded;
        trailing.push(0);
        assert!(EventRecord::decode(&trailing).is_err());
    }
}
