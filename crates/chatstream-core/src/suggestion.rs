//! Suggestions anchored to a specific artifact version.
//!
//! A suggestion names the version it was proposed against; the anchor is a
//! weak reference and never holds back new commits. Applying rebases the
//! anchor-relative range onto the current head. Conflicts are surfaced as a
//! review flag on a still-pending suggestion, never merged automatically.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::EngineError;
use crate::ids::{ArtifactId, SuggestionId};
use crate::rebase::{TextRange, rebase_range, slice, splice};
use crate::version::{ArtifactVersion, VersionChainStore, VersionStamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Applied,
    Dismissed,
    /// The anchor version was removed by a rollback.
    Invalidated,
}

/// Why a pending suggestion needs manual review.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReviewFlag {
    /// A sibling on the same anchor with an overlapping range was applied.
    OverlapsApplied { suggestion_id: SuggestionId },
    /// The range no longer resolves on this head version.
    RebaseConflict { head: VersionStamp },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: SuggestionId,
    pub artifact_id: ArtifactId,
    pub anchor: VersionStamp,
    /// Char offsets into the anchor version's content.
    pub range: TextRange,
    /// Anchor content covered by `range`, captured at proposal time.
    pub original_text: String,
    pub suggested_text: String,
    pub status: SuggestionStatus,
    pub review: Option<ReviewFlag>,
    /// Version materialized by `apply`.
    pub applied_as: Option<VersionStamp>,
    pub created_at: DateTime<Utc>,
}

impl Suggestion {
    pub fn needs_review(&self) -> bool {
        self.status == SuggestionStatus::Pending && self.review.is_some()
    }
}

struct ResolverInner {
    versions: VersionChainStore,
    suggestions: DashMap<SuggestionId, Suggestion>,
    max_rebase_distance: usize,
}

#[derive(Clone)]
pub struct SuggestionResolver {
    inner: Arc<ResolverInner>,
}

impl SuggestionResolver {
    pub fn new(versions: VersionChainStore, max_rebase_distance: usize) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                versions,
                suggestions: DashMap::new(),
                max_rebase_distance,
            }),
        }
    }

    /// Records a suggestion against `anchor`.
    ///
    /// Fails with [`EngineError::StaleAnchor`] when the anchor is not in the
    /// artifact's chain.
    pub fn propose(
        &self,
        artifact_id: &ArtifactId,
        anchor: VersionStamp,
        range: TextRange,
        suggested_text: impl Into<String>,
    ) -> Result<SuggestionId, EngineError> {
        let version = self.anchor_version(artifact_id, anchor)?;
        if !version.kind.supports_suggestions() {
            return Err(EngineError::UnsupportedKind(version.kind));
        }
        let len = version.content.chars().count();
        if range.start > range.end || range.end > len {
            return Err(EngineError::InvalidRange {
                start: range.start,
                end: range.end,
                len,
            });
        }
        let suggestion = Suggestion {
            id: SuggestionId::new(),
            artifact_id: artifact_id.clone(),
            anchor,
            range,
            original_text: slice(&version.content, range).to_string(),
            suggested_text: suggested_text.into(),
            status: SuggestionStatus::Pending,
            review: None,
            applied_as: None,
            created_at: Utc::now(),
        };
        let id = suggestion.id;
        info!(
            event = "suggestion.proposed",
            domain = "suggestion",
            suggestion_id = %id,
            artifact_id = %artifact_id,
            anchor = %anchor,
            start = range.start as u64,
            end = range.end as u64
        );
        self.inner.suggestions.insert(id, suggestion);
        Ok(id)
    }

    /// Materializes the suggestion on top of the current head.
    ///
    /// Returns the stamp of the new version. On [`EngineError::RebaseConflict`]
    /// the suggestion stays pending with a review flag. Applying an already
    /// applied suggestion returns its existing version.
    pub fn apply(&self, suggestion_id: SuggestionId) -> Result<VersionStamp, EngineError> {
        let mut entry = self
            .inner
            .suggestions
            .get_mut(&suggestion_id)
            .ok_or(EngineError::SuggestionNotFound(suggestion_id))?;
        match entry.status {
            SuggestionStatus::Pending => {}
            status @ SuggestionStatus::Applied => {
                return entry.applied_as.ok_or(EngineError::SuggestionClosed {
                    suggestion_id,
                    status,
                });
            }
            SuggestionStatus::Invalidated => {
                return Err(EngineError::StaleAnchor {
                    artifact_id: entry.artifact_id.clone(),
                    anchor: entry.anchor,
                });
            }
            status @ SuggestionStatus::Dismissed => {
                return Err(EngineError::SuggestionClosed {
                    suggestion_id,
                    status,
                });
            }
        }
        if let Some(ReviewFlag::OverlapsApplied { .. }) = entry.review {
            let head = self
                .inner
                .versions
                .head_of(&entry.artifact_id)
                .map(|v| v.created_at)
                .unwrap_or(entry.anchor);
            return Err(EngineError::RebaseConflict {
                suggestion_id,
                head,
            });
        }

        let artifact_id = entry.artifact_id.clone();
        let anchor = match self.anchor_version(&artifact_id, entry.anchor) {
            Ok(version) => version,
            Err(err) => {
                entry.status = SuggestionStatus::Invalidated;
                return Err(err);
            }
        };
        let range = entry.range;
        let suggested = entry.suggested_text.clone();
        let max_distance = self.inner.max_rebase_distance;

        let committed = self.inner.versions.commit_on_head(&artifact_id, |head| {
            let mapped = rebase_range(&anchor.content, &head.content, range, max_distance).ok_or(
                EngineError::RebaseConflict {
                    suggestion_id,
                    head: head.created_at,
                },
            )?;
            Ok(splice(&head.content, mapped, &suggested))
        });
        let version = match committed {
            Ok(version) => version,
            Err(EngineError::RebaseConflict { head, .. }) => {
                entry.review = Some(ReviewFlag::RebaseConflict { head });
                info!(
                    event = "suggestion.rebase_conflict",
                    domain = "suggestion",
                    suggestion_id = %suggestion_id,
                    artifact_id = %artifact_id,
                    head = %head
                );
                return Err(EngineError::RebaseConflict {
                    suggestion_id,
                    head,
                });
            }
            Err(err) => return Err(err),
        };
        entry.status = SuggestionStatus::Applied;
        entry.review = None;
        entry.applied_as = Some(version.created_at);
        let anchor_stamp = entry.anchor;
        drop(entry);

        info!(
            event = "suggestion.applied",
            domain = "suggestion",
            suggestion_id = %suggestion_id,
            artifact_id = %artifact_id,
            created_at = %version.created_at
        );
        self.flag_overlapping(suggestion_id, &artifact_id, anchor_stamp, range);
        Ok(version.created_at)
    }

    fn flag_overlapping(
        &self,
        applied: SuggestionId,
        artifact_id: &ArtifactId,
        anchor: VersionStamp,
        range: TextRange,
    ) {
        for mut sibling in self.inner.suggestions.iter_mut() {
            if sibling.id != applied
                && sibling.artifact_id == *artifact_id
                && sibling.anchor == anchor
                && sibling.status == SuggestionStatus::Pending
                && sibling.range.overlaps(&range)
            {
                sibling.review = Some(ReviewFlag::OverlapsApplied {
                    suggestion_id: applied,
                });
                debug!(
                    event = "suggestion.flagged_overlap",
                    domain = "suggestion",
                    suggestion_id = %sibling.id,
                    applied = %applied
                );
            }
        }
    }

    /// Marks the suggestion dismissed. Returns the canonical state; calling it
    /// on a suggestion that is no longer pending changes nothing.
    pub fn dismiss(&self, suggestion_id: SuggestionId) -> Result<Suggestion, EngineError> {
        let mut entry = self
            .inner
            .suggestions
            .get_mut(&suggestion_id)
            .ok_or(EngineError::SuggestionNotFound(suggestion_id))?;
        if entry.status == SuggestionStatus::Pending {
            entry.status = SuggestionStatus::Dismissed;
            debug!(
                event = "suggestion.dismissed",
                domain = "suggestion",
                suggestion_id = %suggestion_id
            );
        }
        Ok(entry.clone())
    }

    pub fn get(&self, suggestion_id: SuggestionId) -> Option<Suggestion> {
        self.inner
            .suggestions
            .get(&suggestion_id)
            .map(|entry| entry.clone())
    }

    /// Pending suggestions whose anchor is still in the chain, oldest first.
    pub fn list_pending(&self, artifact_id: &ArtifactId) -> Vec<Suggestion> {
        let mut pending: Vec<Suggestion> = self
            .inner
            .suggestions
            .iter()
            .filter(|s| s.artifact_id == *artifact_id && s.status == SuggestionStatus::Pending)
            .map(|s| s.clone())
            .collect();
        pending.retain(|s| self.inner.versions.contains(artifact_id, s.anchor));
        pending.sort_by_key(|s| (s.created_at, s.id));
        pending
    }

    /// Invalidates pending suggestions anchored strictly after `to`.
    pub fn invalidate_after(&self, artifact_id: &ArtifactId, to: VersionStamp) -> Vec<SuggestionId> {
        let mut invalidated = Vec::new();
        for mut suggestion in self.inner.suggestions.iter_mut() {
            if suggestion.artifact_id == *artifact_id
                && suggestion.anchor > to
                && suggestion.status == SuggestionStatus::Pending
            {
                suggestion.status = SuggestionStatus::Invalidated;
                invalidated.push(suggestion.id);
            }
        }
        invalidated.sort();
        if !invalidated.is_empty() {
            info!(
                event = "suggestion.invalidated",
                domain = "suggestion",
                artifact_id = %artifact_id,
                count = invalidated.len() as u64
            );
        }
        invalidated
    }

    /// Re-checks pending suggestions against the current head. Newly
    /// conflicting ones get a review flag (returned); conflict flags that
    /// resolve again are cleared.
    pub fn revalidate(&self, artifact_id: &ArtifactId) -> Vec<SuggestionId> {
        let Some(head) = self.inner.versions.head_of(artifact_id) else {
            return Vec::new();
        };
        let candidates: Vec<Suggestion> = self
            .list_pending(artifact_id)
            .into_iter()
            .filter(|s| !matches!(s.review, Some(ReviewFlag::OverlapsApplied { .. })))
            .collect();

        let mut flagged = Vec::new();
        for suggestion in candidates {
            let Some(anchor) = self.inner.versions.get(artifact_id, suggestion.anchor) else {
                continue;
            };
            let resolves = rebase_range(
                &anchor.content,
                &head.content,
                suggestion.range,
                self.inner.max_rebase_distance,
            )
            .is_some();
            let Some(mut entry) = self.inner.suggestions.get_mut(&suggestion.id) else {
                continue;
            };
            if entry.status != SuggestionStatus::Pending {
                continue;
            }
            match (resolves, entry.review) {
                (false, Some(ReviewFlag::RebaseConflict { .. })) => {
                    entry.review = Some(ReviewFlag::RebaseConflict {
                        head: head.created_at,
                    });
                }
                (false, _) => {
                    entry.review = Some(ReviewFlag::RebaseConflict {
                        head: head.created_at,
                    });
                    flagged.push(entry.id);
                }
                (true, Some(ReviewFlag::RebaseConflict { .. })) => entry.review = None,
                (true, _) => {}
            }
        }
        flagged
    }

    fn anchor_version(
        &self,
        artifact_id: &ArtifactId,
        anchor: VersionStamp,
    ) -> Result<ArtifactVersion, EngineError> {
        self.inner
            .versions
            .get(artifact_id, anchor)
            .ok_or_else(|| EngineError::StaleAnchor {
                artifact_id: artifact_id.clone(),
                anchor,
            })
    }
}
