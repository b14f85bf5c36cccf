//! Turning changed rows into the structure message templates render.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::resource::{CREATED_ON, RecordSet};
use crate::types::Trigger;

/// Title of every digest.
pub const DIGEST_TITLE: &str = "Update Notification";

/// Maximum subject length, including the ellipsis.
pub const SUBJECT_MAX_CHARS: usize = 64;

/// One partition of the digest as a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Template context for a digest.
///
/// `new`/`upd` hold the partition sizes and are `None` when the partition was
/// not requested or is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestView {
    pub title: String,
    pub system: String,
    pub resource: String,
    pub new: Option<usize>,
    pub new_records: Option<DigestTable>,
    pub upd: Option<usize>,
    pub upd_records: Option<DigestTable>,
}

impl DigestView {
    /// Subject line: `<system> <title>: <resource>`, truncated.
    pub fn subject(&self) -> String {
        truncate(
            &format!("{} {}: {}", self.system, self.title, self.resource),
            SUBJECT_MAX_CHARS,
        )
    }
}

/// Decides which partition a row belongs to, if any.
///
/// A row is new if it was created at or after the checkpoint and new records
/// were requested. Otherwise it counts as updated, if updates were requested.
/// With no checkpoint every row that has a creation time is new.
pub fn classify(
    created_on: Option<DateTime<Utc>>,
    checkpoint: Option<DateTime<Utc>>,
    triggers: &BTreeSet<Trigger>,
) -> Option<Trigger> {
    let created_since = match (created_on, checkpoint) {
        (Some(created), Some(checkpoint)) => created >= checkpoint,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if created_since && triggers.contains(&Trigger::New) {
        Some(Trigger::New)
    } else if triggers.contains(&Trigger::Updated) {
        Some(Trigger::Updated)
    } else {
        None
    }
}

/// Partitions `records` and builds the template context.
///
/// Id columns and the creation timestamp are not shown.
pub fn build_digest(
    records: &RecordSet,
    checkpoint: Option<DateTime<Utc>>,
    triggers: &BTreeSet<Trigger>,
    system: &str,
    resource: &str,
) -> DigestView {
    let shown: Vec<usize> = records
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.is_id && c.field != CREATED_ON)
        .map(|(i, _)| i)
        .collect();
    let headers: Vec<String> = shown
        .iter()
        .map(|&i| records.columns[i].label.clone())
        .collect();

    let mut new = Vec::new();
    let mut upd = Vec::new();
    for record in &records.rows {
        let row = shown
            .iter()
            .map(|&i| record.values.get(i).cloned().unwrap_or_default())
            .collect();
        match classify(record.created_on, checkpoint, triggers) {
            Some(Trigger::New) => new.push(row),
            Some(Trigger::Updated) => upd.push(row),
            None => {}
        }
    }

    let table = |rows: Vec<Vec<String>>| {
        (!rows.is_empty()).then(|| DigestTable {
            headers: headers.clone(),
            rows,
        })
    };
    let new_records = table(new);
    let upd_records = table(upd);

    DigestView {
        title: DIGEST_TITLE.to_string(),
        system: system.to_string(),
        resource: resource.to_string(),
        new: new_records.as_ref().map(|t| t.rows.len()),
        new_records,
        upd: upd_records.as_ref().map(|t| t.rows.len()),
        upd_records,
    }
}

/// Truncates to exactly `max` characters, ending in `...` when shortened.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}
