use std::collections::{HashMap, HashSet};
use uuid::Uuid;

type StreamBatches = HashMap<String, HashMap<Uuid, Vec<i64>>>;

/// In-memory record of which row ids are claimed by outstanding batches.
///
/// A row id appears in at most one live batch at a time. Clearing a stream
/// frees its rows for retrieval but remembers which rows each batch held,
/// so a batch that was delivered anyway can still delete exactly its rows.
#[derive(Debug, Default)]
pub struct PendingRows {
    batches: StreamBatches,
    rows: HashSet<i64>,
    abandoned: StreamBatches,
}

impl PendingRows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, row_id: i64) -> bool {
        self.rows.contains(&row_id)
    }

    /// Number of claimed rows belonging to `stream`
    pub fn pending_for(&self, stream: &str) -> usize {
        self.batches
            .get(stream)
            .map(|batches| batches.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn claim(&mut self, stream: &str, batch_id: Uuid, row_ids: Vec<i64>) {
        self.rows.extend(row_ids.iter().copied());
        self.batches
            .entry(stream.to_string())
            .or_default()
            .insert(batch_id, row_ids);
    }

    /// Row ids held by a batch, live or abandoned.
    pub fn rows_of(&self, stream: &str, batch_id: Uuid) -> Option<&[i64]> {
        self.batches
            .get(stream)
            .and_then(|batches| batches.get(&batch_id))
            .or_else(|| self.abandoned.get(stream)?.get(&batch_id))
            .map(Vec::as_slice)
    }

    /// Drop one batch's claim (or its abandoned record) and return the row
    /// ids it held. Rows of an abandoned batch may belong to a newer claim,
    /// so only a live release frees them.
    pub fn release(&mut self, stream: &str, batch_id: Uuid) -> Option<Vec<i64>> {
        if let Some(row_ids) = take_batch(&mut self.batches, stream, batch_id) {
            for row_id in &row_ids {
                self.rows.remove(row_id);
            }
            return Some(row_ids);
        }
        take_batch(&mut self.abandoned, stream, batch_id)
    }

    /// Free every row claimed for `stream`, keeping the batches as abandoned
    /// records. Records left by an earlier abandon are dropped. Returns how
    /// many rows were freed.
    pub fn abandon_stream(&mut self, stream: &str) -> usize {
        let Some(batches) = self.batches.remove(stream) else {
            self.abandoned.remove(stream);
            return 0;
        };
        let mut released = 0;
        for row_id in batches.values().flatten() {
            self.rows.remove(row_id);
            released += 1;
        }
        self.abandoned.insert(stream.to_string(), batches);
        released
    }

    /// Forget everything known about `stream`, live or abandoned.
    pub fn forget_stream(&mut self, stream: &str) {
        if let Some(batches) = self.batches.remove(stream) {
            for row_id in batches.values().flatten() {
                self.rows.remove(row_id);
            }
        }
        self.abandoned.remove(stream);
    }
}

fn take_batch(map: &mut StreamBatches, stream: &str, batch_id: Uuid) -> Option<Vec<i64>> {
    let batches = map.get_mut(stream)?;
    let row_ids = batches.remove(&batch_id)?;
    if batches.is_empty() {
        map.remove(stream);
    }
    Some(row_ids)
}
