//! Session history entries and context reconstruction.
//!
//! Entries form a parent-pointer tree: each session typically grows one
//! linear branch, but resuming from a mid-tree entry forks a sibling
//! branch. Only the path from the chosen leaf back to its root determines
//! the model context.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::provider::ChatMessage;

/// Fields shared by every history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryBase {
    pub id: String,
    pub parent_id: Option<String>,
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
}

impl EntryBase {
    /// Builds a base with a fresh id, parented on `parent_id`.
    pub fn new(parent_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id,
            timestamp: timestamp_now(),
        }
    }
}

/// One persisted history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEntry {
    Message(MessageEntry),
    Compaction(CompactionEntry),
}

/// A message entry: one turn participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub message: ChatMessage,
}

/// A compaction entry: substitutes a summary for everything on the path
/// strictly before `first_kept_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionEntry {
    #[serde(flatten)]
    pub base: EntryBase,
    pub summary: String,
    pub first_kept_id: String,
}

impl SessionEntry {
    pub fn message(parent_id: Option<String>, message: ChatMessage) -> Self {
        Self::Message(MessageEntry {
            base: EntryBase::new(parent_id),
            message,
        })
    }

    pub fn compaction(
        parent_id: Option<String>,
        summary: impl Into<String>,
        first_kept_id: impl Into<String>,
    ) -> Self {
        Self::Compaction(CompactionEntry {
            base: EntryBase::new(parent_id),
            summary: summary.into(),
            first_kept_id: first_kept_id.into(),
        })
    }

    pub fn base(&self) -> &EntryBase {
        match self {
            Self::Message(e) => &e.base,
            Self::Compaction(e) => &e.base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.base().parent_id.as_deref()
    }
}

/// Returns an RFC 3339 UTC timestamp with millisecond precision.
pub(crate) fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Reconstructs the linear message sequence for the model from `leaf_id`.
///
/// Walks parent pointers from the leaf (a visited set terminates the walk
/// on cyclic input), reverses into root-to-leaf order, and materializes
/// the latest compaction on the path: a synthetic `<summary>` user message
/// followed by the kept prefix (entries from `first_kept_id` onward) and
/// everything after the compaction. Earlier compactions on the same path
/// are shadowed. Deterministic given its inputs.
pub fn build_context(entries: &[SessionEntry], leaf_id: Option<&str>) -> Vec<ChatMessage> {
    let Some(leaf_id) = leaf_id else {
        return Vec::new();
    };
    if entries.is_empty() {
        return Vec::new();
    }

    let index: HashMap<&str, &SessionEntry> = entries.iter().map(|e| (e.id(), e)).collect();

    let mut path: Vec<&SessionEntry> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut cursor = Some(leaf_id);
    while let Some(id) = cursor {
        if !seen.insert(id) {
            break;
        }
        let Some(entry) = index.get(id).copied() else {
            break;
        };
        path.push(entry);
        cursor = entry.parent_id();
    }
    path.reverse();

    let compaction_pos = path
        .iter()
        .rposition(|e| matches!(**e, SessionEntry::Compaction(_)));

    let mut messages = Vec::new();
    match compaction_pos {
        Some(pos) => {
            let SessionEntry::Compaction(compaction) = path[pos] else {
                return messages;
            };
            messages.push(ChatMessage::user(format!(
                "<summary>{}</summary>",
                compaction.summary
            )));

            // Keep nothing before the first-kept entry; if it is absent
            // from the prefix, the whole prefix is summarized away.
            let mut keeping = false;
            for entry in &path[..pos] {
                if !keeping && entry.id() == compaction.first_kept_id {
                    keeping = true;
                }
                if keeping {
                    if let SessionEntry::Message(m) = entry {
                        messages.push(m.message.clone());
                    }
                }
            }
            for entry in &path[pos + 1..] {
                if let SessionEntry::Message(m) = entry {
                    messages.push(m.message.clone());
                }
            }
        }
        None => {
            for entry in &path {
                if let SessionEntry::Message(m) = entry {
                    messages.push(m.message.clone());
                }
            }
        }
    }
    messages
}
