use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, OnceLock},
};

use dashmap::DashMap;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::TransferError,
    util::{format_millis, now_millis},
};

use super::{
    db::ParticipantDb,
    participant::{NewParticipant, Profile, Source},
};

/// `[name, phone, email]`
pub type TransferItem = (String, String, String);

/// One scannable piece of a participant list moved between devices.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferChunk {
    /// 1-based position inside the batch
    pub part: u32,
    pub total: u32,
    #[serde(default)]
    pub batch_tag: String,
    #[serde(default)]
    pub timestamp: String,
    pub items: Vec<TransferItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl TransferChunk {
    pub fn parse(raw: &str) -> Result<Self, TransferError> {
        let mut chunk: TransferChunk = serde_json::from_str(raw.trim())
            .map_err(|e| TransferError::Malformed(e.to_string()))?;

        if chunk.total == 0 {
            return Err(TransferError::Malformed("total must be at least 1".to_string()));
        }

        // Older exports have no tag; their event and timestamp identify the batch.
        if chunk.batch_tag.is_empty() {
            chunk.batch_tag = format!(
                "{}_{}",
                chunk.event.as_deref().unwrap_or_default(),
                chunk.timestamp
            );
        }

        Ok(chunk)
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Splits the admitted participant list into chunks whose encoded form stays
/// within `max_payload` bytes.
///
/// People admitted to several events are sent once, keyed by email and
/// phone. A single oversized item still gets a chunk of its own.
pub async fn export_chunks(
    db: &ParticipantDb,
    event_id: &str,
    max_payload: usize,
) -> anyhow::Result<Vec<TransferChunk>> {
    let mut seen = HashSet::new();
    let items: Vec<TransferItem> = db
        .list_admitted()
        .await?
        .into_iter()
        .filter(|p| p.profile.has_contact())
        .filter(|p| {
            seen.insert((
                p.profile.email.trim().to_lowercase(),
                p.profile.phone.trim().to_string(),
            ))
        })
        .map(|p| (p.profile.name, p.profile.phone, p.profile.email))
        .collect();

    if items.is_empty() {
        return Ok(vec![]);
    }

    let now = now_millis();
    let batch_tag = format!(
        "{}-{:x}{:04x}",
        event_id.split_whitespace().collect::<String>(),
        now,
        rand::thread_rng().gen_range(0..0xffff)
    );

    let template = TransferChunk {
        part: items.len() as u32,
        total: items.len() as u32,
        batch_tag,
        timestamp: format_millis(Some(now)),
        items: vec![],
        event: Some(event_id.to_string()),
    };
    let overhead = template.encode()?.len();

    let mut groups: Vec<Vec<TransferItem>> = vec![];
    let mut current: Vec<TransferItem> = vec![];
    let mut size = overhead;
    for item in items {
        let item_size = serde_json::to_string(&item)?.len() + 1;
        if !current.is_empty() && size + item_size > max_payload {
            groups.push(std::mem::take(&mut current));
            size = overhead;
        }
        size += item_size;
        current.push(item);
    }
    groups.push(current);

    let total = groups.len() as u32;
    let chunks: Vec<TransferChunk> = groups
        .into_iter()
        .enumerate()
        .map(|(i, items)| TransferChunk {
            part: i as u32 + 1,
            total,
            items,
            ..template.clone()
        })
        .collect();

    log::info!(
        "Exported batch {} in {} chunks",
        template.batch_tag,
        chunks.len()
    );
    Ok(chunks)
}

/// State of a batch after accepting a chunk.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ImportProgress {
    pub batch_tag: String,
    pub complete: bool,
    pub imported: usize,
    pub duplicates: usize,
    pub parts_received: Vec<u32>,
    pub total: u32,
}

struct PartialBatch {
    total: u32,
    parts: BTreeMap<u32, TransferChunk>,
}

impl PartialBatch {
    fn is_complete(&self) -> bool {
        self.parts.len() as u32 == self.total
    }

    fn received(&self) -> Vec<u32> {
        self.parts.keys().copied().collect()
    }
}

static SEPARATOR_REGEX: OnceLock<Regex> = OnceLock::new();
static WHITESPACE_REGEX: OnceLock<Regex> = OnceLock::new();

/// Deterministic id for a transferred attendee, so replays map to one key.
pub fn import_id(event_id: &str, email: &str, phone: &str) -> String {
    let whitespace = WHITESPACE_REGEX.get_or_init(|| Regex::new(r"\s+").unwrap());
    let separators = SEPARATOR_REGEX.get_or_init(|| Regex::new(r"[@.]").unwrap());

    let contact = if email.trim().is_empty() { phone } else { email };
    format!(
        "IMPORT_{}_{}",
        whitespace.replace_all(event_id, ""),
        separators.replace_all(contact.trim(), "_")
    )
}

/// Reassembles chunked batches and imports them once every part is present.
pub struct ChunkAssembler {
    db: Arc<ParticipantDb>,
    buffers: DashMap<String, PartialBatch>,
}

impl ChunkAssembler {
    pub fn new(db: Arc<ParticipantDb>) -> Self {
        ChunkAssembler {
            db,
            buffers: DashMap::new(),
        }
    }

    /// Buffers a chunk for the device's current event.
    ///
    /// Nothing is written to the local store until the batch is complete.
    pub async fn accept(
        &self,
        chunk: TransferChunk,
        event_id: &str,
    ) -> Result<ImportProgress, TransferError> {
        if let Some(chunk_event) = &chunk.event {
            if chunk_event != event_id {
                return Err(TransferError::EventMismatch {
                    chunk: chunk_event.clone(),
                    current: event_id.to_string(),
                });
            }
        }

        if chunk.part == 0 || chunk.part > chunk.total {
            return Err(TransferError::PartOutOfRange {
                batch: chunk.batch_tag.clone(),
                part: chunk.part,
                total: chunk.total,
            });
        }

        let tag = chunk.batch_tag.clone();
        let part = chunk.part;
        let (received, total, items) = {
            let mut batch = self
                .buffers
                .entry(tag.clone())
                .or_insert_with(|| PartialBatch {
                    total: chunk.total,
                    parts: BTreeMap::new(),
                });

            if batch.total != chunk.total {
                return Err(TransferError::TotalMismatch {
                    batch: tag,
                    expected: batch.total,
                    found: chunk.total,
                });
            }
            if batch.parts.contains_key(&chunk.part) {
                return Err(TransferError::DuplicatePart {
                    batch: tag,
                    part: chunk.part,
                });
            }

            batch.parts.insert(chunk.part, chunk);
            let items: Option<Vec<TransferItem>> = batch.is_complete().then(|| {
                batch
                    .parts
                    .values()
                    .flat_map(|chunk| chunk.items.iter().cloned())
                    .collect()
            });
            (batch.received(), batch.total, items)
        };

        let Some(items) = items else {
            log::debug!("Batch {}: {}/{} parts", tag, received.len(), total);
            return Ok(ImportProgress {
                batch_tag: tag,
                complete: false,
                imported: 0,
                duplicates: 0,
                parts_received: received,
                total,
            });
        };

        // The batch stays buffered until its import went through. On failure
        // the last part is withdrawn so resending it retries the import.
        let (imported, duplicates) = match self.import_items(items, event_id).await {
            Ok(counts) => counts,
            Err(e) => {
                if let Some(mut batch) = self.buffers.get_mut(&tag) {
                    batch.parts.remove(&part);
                }
                log::warn!("Import of batch {} failed, part {} can be resent: {}", tag, part, e);
                return Err(e.into());
            }
        };
        self.buffers.remove(&tag);

        log::info!(
            "Batch {} complete: {} imported, {} duplicates",
            tag,
            imported,
            duplicates
        );
        Ok(ImportProgress {
            batch_tag: tag,
            complete: true,
            imported,
            duplicates,
            parts_received: (1..=total).collect(),
            total,
        })
    }

    pub async fn accept_raw(
        &self,
        raw: &str,
        event_id: &str,
    ) -> Result<ImportProgress, TransferError> {
        self.accept(TransferChunk::parse(raw)?, event_id).await
    }

    async fn import_items(
        &self,
        items: Vec<TransferItem>,
        event_id: &str,
    ) -> anyhow::Result<(usize, usize)> {
        let mut imported = 0;
        let mut duplicates = 0;

        for (name, phone, email) in items {
            if email.trim().is_empty() && phone.trim().is_empty() {
                log::warn!("Skipping transferred item without contact: {:?}", name);
                continue;
            }

            if self
                .db
                .find_by_contact(&email, &phone, Some(event_id))
                .await?
                .is_some()
            {
                duplicates += 1;
                continue;
            }

            let name = if name.trim().is_empty() {
                email.split('@').next().unwrap_or_default().to_string()
            } else {
                name
            };

            let record = NewParticipant::new(
                &import_id(event_id, &email, &phone),
                event_id,
                Profile {
                    name,
                    email,
                    phone,
                    ..Default::default()
                },
                Source::BulkImport,
            );

            if self.db.insert_if_absent(&record).await? {
                imported += 1;
            } else {
                duplicates += 1;
            }
        }

        Ok((imported, duplicates))
    }

    /// Parts received so far for an unfinished batch.
    pub fn progress(&self, batch_tag: &str) -> Option<(Vec<u32>, u32)> {
        self.buffers
            .get(batch_tag)
            .map(|b| (b.received(), b.total))
    }

    /// Drops every partially received batch.
    pub fn clear(&self) {
        self.buffers.clear();
    }
}
