use chatstream_core::{ArtifactId, ArtifactKind, StreamId, VersionStamp};

/// Input content sent to a provider.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum InputPart {
    Text(String),
    Json(serde_json::Value),
}

/// Artifact content accumulated from provider deltas until the generation
/// completes.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ArtifactDraft {
    pub artifact_id: ArtifactId,
    pub kind: ArtifactKind,
    pub title: String,
    pub content: String,
}

impl ArtifactDraft {
    /// Appends a delta to the matching draft, creating it on first sight.
    /// A later title replaces an earlier one.
    pub fn accumulate(
        drafts: &mut Vec<ArtifactDraft>,
        artifact_id: ArtifactId,
        kind: ArtifactKind,
        title: Option<String>,
        delta: &str,
    ) {
        match drafts.iter_mut().find(|d| d.artifact_id == artifact_id) {
            Some(draft) => {
                if let Some(title) = title {
                    draft.title = title;
                }
                draft.content.push_str(delta);
            }
            None => drafts.push(ArtifactDraft {
                title: title.unwrap_or_else(|| artifact_id.to_string()),
                artifact_id,
                kind,
                content: delta.to_string(),
            }),
        }
    }
}

/// Artifact version committed when a generation completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedArtifact {
    pub artifact_id: ArtifactId,
    pub stamp: VersionStamp,
}

/// Final result of a completed generation.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct GenerationOutput {
    pub stream_id: StreamId,
    /// Concatenated text fragments.
    pub text: String,
    pub artifacts: Vec<CommittedArtifact>,
    pub finish_reason: Option<String>,
    /// Number of fragments pushed, including the finish fragment.
    pub fragments: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drafts_merge_by_artifact_and_keep_the_latest_title() {
        let mut drafts = Vec::new();
        let doc = ArtifactId::new("doc");
        ArtifactDraft::accumulate(&mut drafts, doc.clone(), ArtifactKind::Text, None, "Hel");
        ArtifactDraft::accumulate(
            &mut drafts,
            ArtifactId::new("sheet"),
            ArtifactKind::Sheet,
            Some("Budget".into()),
            "a,b",
        );
        ArtifactDraft::accumulate(&mut drafts, doc, ArtifactKind::Text, Some("Notes".into()), "lo");

        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].content, "Hello");
        assert_eq!(drafts[0].title, "Notes");
        assert_eq!(drafts[1].title, "Budget");
    }
}
