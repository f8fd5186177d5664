//! Offline Queue (§4.7): a durable FIFO of rendered CoT events awaiting
//! delivery to the TAK server, safe to restart mid-flight.
//!
//! Same append-only-journal shape as `audit.rs` (itself grounded on the WAL
//! module's framed-entry-plus-CRC idiom): every state transition — enqueue,
//! mark synced, mark failed — appends a fresh full record for that item's
//! `seq` rather than mutating bytes in place, so a crash mid-write can never
//! leave a half-updated record; replay on open always lands on the last
//! complete record per `seq`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{QueueItem, QueueStatus};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue io error: {0}")]
    Io(#[from] io::Error),
    #[error("queue record truncated while reading {0}")]
    UnexpectedEof(&'static str),
    #[error("queue crc mismatch: stored {stored:#010x} computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },
    #[error("queue is at capacity")]
    Full,
    #[error("last_error field exceeds 256 bytes")]
    LastErrorTooLong,
    #[error("unknown queue item seq {0}")]
    NotFound(u64),
    #[error("invalid status byte {0}")]
    InvalidStatus(u8),
}

type Result<T> = std::result::Result<T, QueueError>;

const MAX_LAST_ERROR_LEN: usize = 256;

/// Backoff schedule, attempt number -> base delay (§3, §4.7). Attempt counts
/// beyond the table reuse the final entry.
const BACKOFF_TABLE_SECS: &[u64] = &[1, 2, 4, 8, 16];

/// Computes the next-attempt delay for a given attempt count, with +/-20%
/// jitter so a fleet of queues doesn't retry in lockstep.
pub fn backoff_delay_secs(attempts: u8, rng: &mut impl Rng) -> u64 {
    let idx = (attempts.saturating_sub(1) as usize).min(BACKOFF_TABLE_SECS.len() - 1);
    let base = BACKOFF_TABLE_SECS[idx] as f64;
    let jitter = rng.gen_range(-0.2..=0.2);
    ((base * (1.0 + jitter)).max(0.0)) as u64
}

fn status_to_u8(s: QueueStatus) -> u8 {
    s as u8
}

/// Encodes one record: seq(8) | detection_id(16) | enqueued_at_ms(8) |
/// attempts(1) | next_attempt_at_ms(8) | status(1) | last_error_len(2, BE) |
/// last_error | cot_xml_len(4, BE) | cot_xml | crc32(4).
fn encode_record(item: &QueueItem) -> Result<Vec<u8>> {
    if item.last_error.len() > MAX_LAST_ERROR_LEN {
        return Err(QueueError::LastErrorTooLong);
    }
    let mut body = Vec::with_capacity(64 + item.last_error.len() + item.cot_xml.len());
    body.extend_from_slice(&item.seq.to_be_bytes());
    body.extend_from_slice(item.detection_id.as_bytes());
    body.extend_from_slice(&item.enqueued_at_ms.to_be_bytes());
    body.push(item.attempts);
    body.extend_from_slice(&item.next_attempt_at_ms.to_be_bytes());
    body.push(status_to_u8(item.status));
    body.extend_from_slice(&(item.last_error.len() as u16).to_be_bytes());
    body.extend_from_slice(item.last_error.as_bytes());
    body.extend_from_slice(&(item.cot_xml.len() as u32).to_be_bytes());
    body.extend_from_slice(&item.cot_xml);

    let crc = crc32fast::hash(&body);
    let mut record = body;
    record.extend_from_slice(&crc.to_be_bytes());
    Ok(record)
}

/// Returns the decoded item and the number of bytes the record occupied.
fn decode_record(bytes: &[u8]) -> Result<(QueueItem, usize)> {
    const FIXED_PREFIX: usize = 8 + 16 + 8 + 1 + 8 + 1 + 2;
    if bytes.len() < FIXED_PREFIX {
        return Err(QueueError::UnexpectedEof("fixed prefix"));
    }
    let mut pos = 0;
    let seq = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let detection_id = Uuid::from_bytes(bytes[pos..pos + 16].try_into().unwrap());
    pos += 16;
    let enqueued_at_ms = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let attempts = bytes[pos];
    pos += 1;
    let next_attempt_at_ms = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let status_byte = bytes[pos];
    pos += 1;
    let status = QueueStatus::from_u8(status_byte).ok_or(QueueError::InvalidStatus(status_byte))?;
    let last_error_len = u16::from_be_bytes(bytes[pos..pos + 2].try_into().unwrap()) as usize;
    pos += 2;

    if bytes.len() < pos + last_error_len + 4 {
        return Err(QueueError::UnexpectedEof("last_error/cot_xml_len"));
    }
    let last_error = String::from_utf8_lossy(&bytes[pos..pos + last_error_len]).into_owned();
    pos += last_error_len;
    let cot_xml_len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;

    if bytes.len() < pos + cot_xml_len + 4 {
        return Err(QueueError::UnexpectedEof("cot_xml/crc"));
    }
    let cot_xml = bytes[pos..pos + cot_xml_len].to_vec();
    pos += cot_xml_len;

    let stored_crc = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap());
    let record_len = pos + 4;
    let computed_crc = crc32fast::hash(&bytes[..pos]);
    if stored_crc != computed_crc {
        return Err(QueueError::CrcMismatch { stored: stored_crc, computed: computed_crc });
    }

    Ok((
        QueueItem { seq, detection_id, cot_xml, enqueued_at_ms, attempts, next_attempt_at_ms, last_error, status },
        record_len,
    ))
}

struct Inner {
    file: File,
    /// Insertion order of seqs, preserved for FIFO scanning.
    order: Vec<u64>,
    items: HashMap<u64, QueueItem>,
    next_seq: u64,
}

pub struct OfflineQueue {
    path: PathBuf,
    capacity: usize,
    inner: Mutex<Inner>,
}

pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

impl OfflineQueue {
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;

        let mut raw = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut raw)?;

        let mut order = Vec::new();
        let mut items: HashMap<u64, QueueItem> = HashMap::new();
        let mut cursor = 0usize;
        while cursor < raw.len() {
            match decode_record(&raw[cursor..]) {
                Ok((item, len)) => {
                    if !items.contains_key(&item.seq) {
                        order.push(item.seq);
                    }
                    items.insert(item.seq, item);
                    cursor += len;
                }
                Err(_) => break,
            }
        }
        file.seek(SeekFrom::End(0))?;

        let next_seq = items.keys().max().map(|s| s + 1).unwrap_or(1);

        let queue = Self {
            path,
            capacity,
            inner: Mutex::new(Inner { file, order, items, next_seq }),
        };
        queue.reclaim_in_flight()?;
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// On restart, any item still marked `InFlight` was interrupted
    /// mid-delivery; it becomes immediately retryable `Pending` again (§4.7).
    fn reclaim_in_flight(&self) -> Result<()> {
        let now = now_ms();
        let stuck: Vec<u64> = {
            let inner = self.inner.lock().unwrap();
            inner
                .items
                .values()
                .filter(|i| i.status == QueueStatus::InFlight)
                .map(|i| i.seq)
                .collect()
        };
        for seq in stuck {
            self.transition(seq, |item| {
                item.status = QueueStatus::Pending;
                item.next_attempt_at_ms = now;
            })?;
        }
        Ok(())
    }

    fn persist(&self, inner: &mut Inner, item: &QueueItem) -> Result<()> {
        let record = encode_record(item)?;
        inner.file.write_all(&record)?;
        inner.file.sync_data()?;
        Ok(())
    }

    fn transition(&self, seq: u64, f: impl FnOnce(&mut QueueItem)) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut item = inner.items.get(&seq).cloned().ok_or(QueueError::NotFound(seq))?;
        f(&mut item);
        self.persist(&mut inner, &item)?;
        inner.items.insert(seq, item);
        Ok(())
    }

    /// Active (non-SYNCED) item count, the figure the capacity check is
    /// against (§4.7).
    pub fn size(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.items.values().filter(|i| i.status != QueueStatus::Synced).count()
    }

    /// Appends a new CoT event to the queue. Enforces §4.7's invariant that
    /// at most one non-SYNCED item exists per `detection_id`: a second
    /// enqueue for a detection already in flight returns the existing seq
    /// instead of creating a duplicate delivery.
    pub fn enqueue(&self, detection_id: Uuid, cot_xml: Vec<u8>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.items.values().find(|i| i.detection_id == detection_id && i.status != QueueStatus::Synced) {
            return Ok(existing.seq);
        }

        let active = inner.items.values().filter(|i| i.status != QueueStatus::Synced).count();
        if active >= self.capacity {
            return Err(QueueError::Full);
        }

        let seq = inner.next_seq;
        let now = now_ms();
        let item = QueueItem {
            seq,
            detection_id,
            cot_xml,
            enqueued_at_ms: now,
            attempts: 0,
            next_attempt_at_ms: now,
            last_error: String::new(),
            status: QueueStatus::Pending,
        };
        self.persist(&mut inner, &item)?;
        inner.order.push(seq);
        inner.items.insert(seq, item);
        inner.next_seq += 1;
        Ok(seq)
    }

    /// Up to `limit` PENDING items whose `next_attempt_at_ms` has elapsed,
    /// in FIFO order, transitioned to IN_FLIGHT as they're claimed so a
    /// concurrent caller won't double-claim them.
    pub fn peek_batch(&self, limit: usize, now: u64) -> Result<Vec<QueueItem>> {
        let mut inner = self.inner.lock().unwrap();
        let candidates: Vec<u64> = inner
            .order
            .iter()
            .filter(|seq| {
                inner
                    .items
                    .get(seq)
                    .map(|i| i.status == QueueStatus::Pending && i.next_attempt_at_ms <= now)
                    .unwrap_or(false)
            })
            .take(limit)
            .cloned()
            .collect();

        let mut claimed = Vec::with_capacity(candidates.len());
        for seq in candidates {
            let mut item = inner.items.get(&seq).unwrap().clone();
            item.status = QueueStatus::InFlight;
            self.persist(&mut inner, &item)?;
            inner.items.insert(seq, item.clone());
            claimed.push(item);
        }
        Ok(claimed)
    }

    pub fn mark_synced(&self, seq: u64) -> Result<()> {
        self.transition(seq, |item| {
            item.status = QueueStatus::Synced;
            item.last_error.clear();
        })
    }

    /// Records a failed delivery attempt. `terminal` marks the item FAILED
    /// with no further retries (a non-retryable 4xx); otherwise it goes back
    /// to PENDING with the backoff-scheduled next attempt, unless `attempts`
    /// has now reached the retry cap, in which case it too becomes FAILED
    /// (§4.7: "when attempts ≥ 5 transitions to FAILED terminally"). Returns
    /// the resulting status so callers can tell a retryable failure apart
    /// from one that has just been abandoned.
    pub fn mark_failed(&self, seq: u64, error: &str, terminal: bool, rng: &mut impl Rng) -> Result<QueueStatus> {
        let truncated: String = error.chars().take(MAX_LAST_ERROR_LEN).collect();
        let mut final_status = QueueStatus::Pending;
        self.transition(seq, |item| {
            item.attempts = item.attempts.saturating_add(1);
            item.last_error = truncated;
            if terminal || item.attempts >= 5 {
                item.status = QueueStatus::Failed;
            } else {
                item.status = QueueStatus::Pending;
                item.next_attempt_at_ms = now_ms() + backoff_delay_secs(item.attempts, rng) * 1000;
            }
            final_status = item.status;
        })?;
        Ok(final_status)
    }

    /// Reverts every currently IN_FLIGHT item back to PENDING without
    /// incrementing `attempts`, tagging `last_error = "cancelled"`. Used by
    /// the delivery worker's cooperative-shutdown drain (§4.8: "attempts
    /// unchanged"), distinct from `mark_failed`, which always counts an
    /// attempt.
    pub fn cancel_in_flight(&self) -> Result<Vec<u64>> {
        let now = now_ms();
        let stuck: Vec<u64> = {
            let inner = self.inner.lock().unwrap();
            inner
                .items
                .values()
                .filter(|i| i.status == QueueStatus::InFlight)
                .map(|i| i.seq)
                .collect()
        };
        for seq in &stuck {
            self.transition(*seq, |item| {
                item.status = QueueStatus::Pending;
                item.next_attempt_at_ms = now;
                item.last_error = "cancelled".to_string();
            })?;
        }
        Ok(stuck)
    }

    /// Drops the oldest PENDING/FAILED item to relieve capacity pressure
    /// (§4.7). Permitted only when the active (non-SYNCED) count is already
    /// at or over capacity; a no-op otherwise. Returns the dropped item's
    /// `(seq, detection_id)` so the caller can record the mandated
    /// RETRY_EXHAUSTED audit event.
    pub fn drop_oldest_pending(&self) -> Result<Option<(u64, Uuid)>> {
        let mut inner = self.inner.lock().unwrap();
        let active = inner.items.values().filter(|i| i.status != QueueStatus::Synced).count();
        if active < self.capacity {
            return Ok(None);
        }

        let victim = inner
            .order
            .iter()
            .find(|seq| {
                inner
                    .items
                    .get(seq)
                    .map(|i| i.status == QueueStatus::Pending || i.status == QueueStatus::Failed)
                    .unwrap_or(false)
            })
            .cloned();
        let Some(seq) = victim else { return Ok(None) };

        let mut item = inner.items.get(&seq).cloned().unwrap();
        let detection_id = item.detection_id;
        item.status = QueueStatus::Synced; // retire it from the active set without re-delivering
        item.last_error = "dropped: queue at capacity".to_string();
        self.persist(&mut inner, &item)?;
        inner.items.insert(seq, item);
        Ok(Some((seq, detection_id)))
    }
}
