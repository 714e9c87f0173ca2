use super::Lsn;
use crate::errors::DbError;
use crate::pages::PageId;
use crate::tuple::Rid;
use crate::txn::TxnId;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Type-specific body of a log record. Tuples are carried as their
/// serialized bytes so recovery can replay them without schemas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogPayload {
    Begin,
    Commit,
    Abort,
    Insert {
        rid: Rid,
        tuple: Vec<u8>,
    },
    Delete {
        rid: Rid,
        tuple: Vec<u8>,
    },
    Update {
        rid: Rid,
        old_tuple: Vec<u8>,
        new_tuple: Vec<u8>,
    },
    /// A fresh heap page chained after `prev_page_id`.
    NewPage {
        page_id: PageId,
        prev_page_id: PageId,
    },
    Checkpoint {
        active_txns: Vec<(TxnId, Lsn)>,
        dirty_pages: Vec<(PageId, Lsn)>,
    },
}

impl LogPayload {
    pub fn discriminator(&self) -> u8 {
        match self {
            LogPayload::Begin => 1,
            LogPayload::Commit => 2,
            LogPayload::Abort => 3,
            LogPayload::Insert { .. } => 4,
            LogPayload::Delete { .. } => 5,
            LogPayload::Update { .. } => 6,
            LogPayload::NewPage { .. } => 7,
            LogPayload::Checkpoint { .. } => 8,
        }
    }

    /// Page a data record touches, for the dirty-page table.
    pub fn affected_page(&self) -> Option<PageId> {
        match self {
            LogPayload::Insert { rid, .. }
            | LogPayload::Delete { rid, .. }
            | LogPayload::Update { rid, .. } => Some(rid.page_id),
            LogPayload::NewPage { page_id, .. } => Some(*page_id),
            _ => None,
        }
    }

    pub fn is_data(&self) -> bool {
        self.affected_page().is_some()
    }
}

/// One write-ahead log record. `prev_lsn` chains backward through the
/// same transaction's records and drives undo.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub txn_id: TxnId,
    pub payload: LogPayload,
}

/// discriminator + lsn + prev_lsn + txn_id + body length
const RECORD_HEADER_SIZE: usize = 1 + 4 + 4 + 4 + 4;

impl LogRecord {
    /// Wire form: `u8 discriminator; u32 lsn; u32 prev_lsn; u32 txn_id;
    /// u32 body_len; body`, all little-endian, body bincode-encoded.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let body = bincode::serialize(&self.payload).context("serializing log record body")?;
        out.push(self.payload.discriminator());
        out.extend_from_slice(&self.lsn.to_le_bytes());
        out.extend_from_slice(&self.prev_lsn.to_le_bytes());
        out.extend_from_slice(&self.txn_id.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(())
    }

    /// Decodes the record at `pos`, advancing it. Returns None at a clean
    /// end of the stream; an incomplete trailing record (a torn tail from
    /// a crash mid-flush) also ends the stream.
    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Option<LogRecord>> {
        if *pos == buf.len() {
            return Ok(None);
        }
        if *pos + RECORD_HEADER_SIZE > buf.len() {
            log::warn!("log ends in a torn record header, ignoring the tail");
            *pos = buf.len();
            return Ok(None);
        }
        let header = &buf[*pos..*pos + RECORD_HEADER_SIZE];
        let discriminator = header[0];
        if !(1..=8).contains(&discriminator) {
            bail!(DbError::Corruption(format!(
                "log discriminator {discriminator} at offset {pos}"
            )));
        }
        let lsn = u32::from_le_bytes(header[1..5].try_into()?);
        let prev_lsn = u32::from_le_bytes(header[5..9].try_into()?);
        let txn_id = u32::from_le_bytes(header[9..13].try_into()?);
        let body_len = u32::from_le_bytes(header[13..17].try_into()?) as usize;

        let body_start = *pos + RECORD_HEADER_SIZE;
        if body_start + body_len > buf.len() {
            log::warn!("log ends in a torn record body, ignoring the tail");
            *pos = buf.len();
            return Ok(None);
        }
        let payload: LogPayload = bincode::deserialize(&buf[body_start..body_start + body_len])
            .map_err(|e| DbError::Corruption(format!("log record body at lsn {lsn}: {e}")))?;
        if payload.discriminator() != discriminator {
            bail!(DbError::Corruption(format!(
                "log record lsn {lsn} body disagrees with its discriminator"
            )));
        }
        *pos = body_start + body_len;
        Ok(Some(LogRecord {
            lsn,
            prev_lsn,
            txn_id,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::INVALID_LSN;
    use anyhow::Result;

    fn sample_records() -> Vec<LogRecord> {
        vec![
            LogRecord {
                lsn: 1,
                prev_lsn: INVALID_LSN,
                txn_id: 9,
                payload: LogPayload::Begin,
            },
            LogRecord {
                lsn: 2,
                prev_lsn: 1,
                txn_id: 9,
                payload: LogPayload::Insert {
                    rid: Rid::new(3, 0),
                    tuple: vec![1, 2, 3],
                },
            },
            LogRecord {
                lsn: 3,
                prev_lsn: 2,
                txn_id: 9,
                payload: LogPayload::Update {
                    rid: Rid::new(3, 0),
                    old_tuple: vec![1, 2, 3],
                    new_tuple: vec![4, 5],
                },
            },
            LogRecord {
                lsn: 4,
                prev_lsn: 3,
                txn_id: 9,
                payload: LogPayload::Commit,
            },
            LogRecord {
                lsn: 5,
                prev_lsn: INVALID_LSN,
                txn_id: 10,
                payload: LogPayload::Checkpoint {
                    active_txns: vec![(9, 4)],
                    dirty_pages: vec![(3, 2)],
                },
            },
        ]
    }

    #[test]
    fn test_record_stream_round_trip() -> Result<()> {
        let records = sample_records();
        let mut buf = vec![];
        for r in &records {
            r.encode(&mut buf)?;
        }
        let mut pos = 0;
        let mut back = vec![];
        while let Some(r) = LogRecord::decode(&buf, &mut pos)? {
            back.push(r);
        }
        assert_eq!(back, records);
        Ok(())
    }

    #[test]
    fn test_torn_tail_ends_stream() -> Result<()> {
        let records = sample_records();
        let mut buf = vec![];
        for r in &records {
            r.encode(&mut buf)?;
        }
        buf.truncate(buf.len() - 2);
        let mut pos = 0;
        let mut count = 0;
        while let Some(_) = LogRecord::decode(&buf, &mut pos)? {
            count += 1;
        }
        assert_eq!(count, records.len() - 1);
        Ok(())
    }

    #[test]
    fn test_bad_discriminator_is_corruption() -> Result<()> {
        let mut buf = vec![];
        sample_records()[0].encode(&mut buf)?;
        buf[0] = 99;
        let err = LogRecord::decode(&buf, &mut 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn test_empty_log_is_fine() -> Result<()> {
        assert!(LogRecord::decode(&[], &mut 0)?.is_none());
        Ok(())
    }
}
