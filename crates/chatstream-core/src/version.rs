//! Append-only artifact version chains.
//!
//! Each artifact owns a chain of immutable snapshots. A version is identified
//! by `(artifact_id, created_at)` where `created_at` is a [`VersionStamp`]:
//! wall-clock time paired with a per-artifact counter, so two commits inside
//! the same clock tick still get a strict order.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::EngineError;
use crate::ids::ArtifactId;
use crate::journal::{Journal, JournalEntry};

/// Creation stamp of an artifact version. Ordered by time, then counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionStamp {
    pub at: DateTime<Utc>,
    pub seq: u64,
}

impl VersionStamp {
    pub fn first(at: DateTime<Utc>) -> Self {
        Self { at, seq: 0 }
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.at.to_rfc3339(), self.seq)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Text,
    Code,
    Image,
    Sheet,
}

impl ArtifactKind {
    /// Whether content is editable text that suggestions can address by range.
    pub fn supports_suggestions(&self) -> bool {
        !matches!(self, Self::Image)
    }
}

/// Immutable snapshot of an artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactVersion {
    pub artifact_id: ArtifactId,
    pub created_at: VersionStamp,
    pub kind: ArtifactKind,
    pub title: String,
    pub content: String,
}

#[derive(Default)]
struct Chain {
    versions: Vec<ArtifactVersion>,
    // Never decreases, even across rollback, so removed stamps are not reissued.
    next_seq: u64,
    last_at: Option<DateTime<Utc>>,
}

impl Chain {
    fn next_stamp(&mut self, now: DateTime<Utc>) -> VersionStamp {
        let at = match self.last_at {
            Some(last) if last > now => last,
            _ => now,
        };
        let stamp = VersionStamp {
            at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.last_at = Some(at);
        stamp
    }

    fn push(&mut self, version: ArtifactVersion) {
        self.next_seq = self.next_seq.max(version.created_at.seq + 1);
        self.last_at = Some(match self.last_at {
            Some(last) if last > version.created_at.at => last,
            _ => version.created_at.at,
        });
        self.versions.push(version);
    }

    fn position(&self, stamp: VersionStamp) -> Option<usize> {
        self.versions
            .binary_search_by(|v| v.created_at.cmp(&stamp))
            .ok()
    }
}

struct StoreInner {
    chains: DashMap<ArtifactId, Chain>,
    journal: Option<Arc<dyn Journal>>,
}

/// Shared handle to every artifact's version chain.
#[derive(Clone)]
pub struct VersionChainStore {
    inner: Arc<StoreInner>,
}

impl VersionChainStore {
    pub fn new(journal: Option<Arc<dyn Journal>>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                chains: DashMap::new(),
                journal,
            }),
        }
    }

    /// Appends a new version and returns its stamp.
    pub fn commit(
        &self,
        artifact_id: &ArtifactId,
        kind: ArtifactKind,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<VersionStamp, EngineError> {
        let mut chain = self.inner.chains.entry(artifact_id.clone()).or_default();
        let version = ArtifactVersion {
            artifact_id: artifact_id.clone(),
            created_at: chain.next_stamp(Utc::now()),
            kind,
            title: title.into(),
            content: content.into(),
        };
        self.append_locked(&mut chain, version)
    }

    /// Commits a version derived from the current head while holding the
    /// chain lock, so no other commit can land between read and write.
    pub(crate) fn commit_on_head<F>(
        &self,
        artifact_id: &ArtifactId,
        derive: F,
    ) -> Result<ArtifactVersion, EngineError>
    where
        F: FnOnce(&ArtifactVersion) -> Result<String, EngineError>,
    {
        let mut chain = self
            .inner
            .chains
            .get_mut(artifact_id)
            .ok_or_else(|| EngineError::ArtifactNotFound(artifact_id.clone()))?;
        let head = chain
            .versions
            .last()
            .cloned()
            .ok_or_else(|| EngineError::ArtifactNotFound(artifact_id.clone()))?;
        let content = derive(&head)?;
        let version = ArtifactVersion {
            artifact_id: artifact_id.clone(),
            created_at: chain.next_stamp(Utc::now()),
            kind: head.kind,
            title: head.title,
            content,
        };
        self.append_locked(&mut chain, version.clone())?;
        Ok(version)
    }

    fn append_locked(
        &self,
        chain: &mut Chain,
        version: ArtifactVersion,
    ) -> Result<VersionStamp, EngineError> {
        if let Some(journal) = &self.inner.journal {
            journal.record(&JournalEntry::VersionCommitted {
                version: version.clone(),
            })?;
        }
        let stamp = version.created_at;
        debug!(
            event = "artifact.version_committed",
            domain = "artifact",
            artifact_id = %version.artifact_id,
            created_at = %stamp,
            kind = ?version.kind,
            content_len = version.content.len() as u64
        );
        chain.push(version);
        Ok(stamp)
    }

    pub fn head_of(&self, artifact_id: &ArtifactId) -> Option<ArtifactVersion> {
        self.inner
            .chains
            .get(artifact_id)
            .and_then(|chain| chain.versions.last().cloned())
    }

    /// All versions, oldest first.
    pub fn list_versions(&self, artifact_id: &ArtifactId) -> Vec<ArtifactVersion> {
        self.inner
            .chains
            .get(artifact_id)
            .map(|chain| chain.versions.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, artifact_id: &ArtifactId, stamp: VersionStamp) -> Option<ArtifactVersion> {
        let chain = self.inner.chains.get(artifact_id)?;
        chain
            .position(stamp)
            .map(|idx| chain.versions[idx].clone())
    }

    pub fn contains(&self, artifact_id: &ArtifactId, stamp: VersionStamp) -> bool {
        self.inner
            .chains
            .get(artifact_id)
            .is_some_and(|chain| chain.position(stamp).is_some())
    }

    /// Removes every version strictly newer than `to` and returns their stamps.
    ///
    /// The removed stamps are anchors that suggestions may still reference;
    /// the caller reconciles them.
    pub fn rollback(
        &self,
        artifact_id: &ArtifactId,
        to: VersionStamp,
    ) -> Result<Vec<VersionStamp>, EngineError> {
        let mut chain = self
            .inner
            .chains
            .get_mut(artifact_id)
            .ok_or_else(|| EngineError::ArtifactNotFound(artifact_id.clone()))?;
        let idx = chain
            .position(to)
            .ok_or_else(|| EngineError::VersionNotFound {
                artifact_id: artifact_id.clone(),
                stamp: to,
            })?;
        if idx + 1 == chain.versions.len() {
            return Ok(Vec::new());
        }
        if let Some(journal) = &self.inner.journal {
            journal.record(&JournalEntry::VersionsRolledBack {
                artifact_id: artifact_id.clone(),
                to,
            })?;
        }
        let removed: Vec<VersionStamp> = chain
            .versions
            .drain(idx + 1..)
            .map(|v| v.created_at)
            .collect();
        info!(
            event = "artifact.rolled_back",
            domain = "artifact",
            artifact_id = %artifact_id,
            to = %to,
            removed = removed.len() as u64
        );
        Ok(removed)
    }

    /// Journal entries that rebuild every chain, each followed by its
    /// stamp watermark.
    pub(crate) fn snapshot(&self) -> Vec<JournalEntry> {
        let mut chains: Vec<(ArtifactId, Vec<JournalEntry>)> = self
            .inner
            .chains
            .iter()
            .map(|entry| {
                let chain = entry.value();
                let mut entries: Vec<JournalEntry> = chain
                    .versions
                    .iter()
                    .cloned()
                    .map(|version| JournalEntry::VersionCommitted { version })
                    .collect();
                entries.push(JournalEntry::ChainWatermark {
                    artifact_id: entry.key().clone(),
                    next_seq: chain.next_seq,
                    last_at: chain.last_at,
                });
                (entry.key().clone(), entries)
            })
            .collect();
        chains.sort_by(|a, b| a.0.cmp(&b.0));
        chains.into_iter().flat_map(|(_, entries)| entries).collect()
    }

    pub(crate) fn restore_watermark(
        &self,
        artifact_id: &ArtifactId,
        next_seq: u64,
        last_at: Option<DateTime<Utc>>,
    ) {
        let mut chain = self.inner.chains.entry(artifact_id.clone()).or_default();
        chain.next_seq = chain.next_seq.max(next_seq);
        if let Some(at) = last_at {
            chain.last_at = Some(chain.last_at.map_or(at, |last| last.max(at)));
        }
    }

    pub(crate) fn restore_version(&self, version: ArtifactVersion) {
        let mut chain = self
            .inner
            .chains
            .entry(version.artifact_id.clone())
            .or_default();
        chain.push(version);
    }

    pub(crate) fn restore_rollback(&self, artifact_id: &ArtifactId, to: VersionStamp) {
        if let Some(mut chain) = self.inner.chains.get_mut(artifact_id)
            && let Some(idx) = chain.position(to)
        {
            chain.versions.truncate(idx + 1);
        }
    }
}
