//! In-memory metadata filtering.
//!
//! The vector store pushes down language and id predicates; everything
//! about workflow metadata is evaluated here, over hydrated entries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::entry::{EntryMetadata, WorkflowState};

/// Metadata constraints applied to search results.
///
/// Constraints are evaluated in order: `states`, `min_state`,
/// `min_quality`, `context_includes`, `required_properties`, `provider`.
/// An entry with no metadata fails any constraint that references it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchFilter {
    /// Accepted workflow states (exact set membership).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub states: Option<Vec<WorkflowState>>,
    /// Minimum workflow state by rank.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_state: Option<WorkflowState>,
    /// Minimum quality score (0–100).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_quality: Option<u32>,
    /// Every needle must appear, case-insensitively, in `metadata.context`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context_includes: Vec<String>,
    /// Every key/value pair must match exactly in `metadata.properties`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub required_properties: BTreeMap<String, String>,
    /// Must equal `metadata.segment.provider`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl SearchFilter {
    /// True when the filter constrains nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Evaluate against an entry's metadata.
    pub fn matches(&self, metadata: Option<&EntryMetadata>) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(meta) = metadata else {
            // No metadata: only an unconstrained filter accepts.
            return false;
        };

        if let Some(states) = &self.states {
            match meta.state {
                Some(state) if states.contains(&state) => {}
                _ => return false,
            }
        }

        if let Some(min_state) = self.min_state {
            match meta.state {
                Some(state) if state.rank() >= min_state.rank() => {}
                _ => return false,
            }
        }

        if let Some(min_quality) = self.min_quality {
            match meta.quality {
                Some(quality) if quality >= min_quality => {}
                _ => return false,
            }
        }

        if !self.context_includes.is_empty() {
            let Some(context) = &meta.context else {
                return false;
            };
            let haystack = context.to_lowercase();
            for needle in &self.context_includes {
                if !haystack.contains(&needle.to_lowercase()) {
                    return false;
                }
            }
        }

        for (key, expected) in &self.required_properties {
            if meta.properties.get(key) != Some(expected) {
                return false;
            }
        }

        if let Some(provider) = &self.provider {
            match &meta.segment {
                Some(segment) if &segment.provider == provider => {}
                _ => return false,
            }
        }

        true
    }
}

/// Source- and target-side filters for translation search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranslationFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SearchFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<SearchFilter>,
}

impl TranslationFilters {
    /// Filter applied to the source side of a pair. When no source filter
    /// is configured but a target filter is, the target filter applies to
    /// the source side too.
    pub fn source_side(&self) -> Option<&SearchFilter> {
        self.source.as_ref().or(self.target.as_ref())
    }

    pub fn target_side(&self) -> Option<&SearchFilter> {
        self.target.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::SegmentProvenance;

    fn meta(state: Option<WorkflowState>, quality: Option<u32>, context: Option<&str>) -> EntryMetadata {
        EntryMetadata {
            state,
            quality,
            context: context.map(str::to_owned),
            ..Default::default()
        }
    }

    #[test]
    fn empty_filter_accepts_everything() {
        let filter = SearchFilter::default();
        assert!(filter.matches(None));
        assert!(filter.matches(Some(&meta(None, None, None))));
    }

    #[test]
    fn missing_metadata_fails_constrained_filters() {
        let filter = SearchFilter {
            min_state: Some(WorkflowState::Translated),
            ..Default::default()
        };
        assert!(!filter.matches(None));
        assert!(!filter.matches(Some(&meta(None, None, None))));
    }

    #[test]
    fn state_set_membership() {
        let filter = SearchFilter {
            states: Some(vec![WorkflowState::Reviewed, WorkflowState::Final]),
            ..Default::default()
        };
        assert!(filter.matches(Some(&meta(Some(WorkflowState::Final), None, None))));
        assert!(!filter.matches(Some(&meta(Some(WorkflowState::Translated), None, None))));
    }

    #[test]
    fn min_state_is_rank_based() {
        let filter = SearchFilter {
            min_state: Some(WorkflowState::Translated),
            ..Default::default()
        };
        assert!(!filter.matches(Some(&meta(Some(WorkflowState::Initial), None, None))));
        assert!(filter.matches(Some(&meta(Some(WorkflowState::Translated), None, None))));
        assert!(filter.matches(Some(&meta(Some(WorkflowState::Final), None, None))));
    }

    #[test]
    fn raising_min_state_never_widens_results() {
        let entries = [
            meta(Some(WorkflowState::Initial), None, None),
            meta(Some(WorkflowState::Translated), None, None),
            meta(Some(WorkflowState::Reviewed), None, None),
            meta(Some(WorkflowState::Final), None, None),
            meta(None, None, None),
        ];
        let mut previous = usize::MAX;
        for min_state in [
            WorkflowState::Initial,
            WorkflowState::Translated,
            WorkflowState::Reviewed,
            WorkflowState::Final,
        ] {
            let filter = SearchFilter {
                min_state: Some(min_state),
                ..Default::default()
            };
            let accepted = entries.iter().filter(|m| filter.matches(Some(m))).count();
            assert!(accepted <= previous);
            previous = accepted;
        }
    }

    #[test]
    fn context_needles_are_case_insensitive_and_conjunctive() {
        let filter = SearchFilter {
            context_includes: vec!["UI.Settings".into(), "dialog".into()],
            ..Default::default()
        };
        assert!(filter.matches(Some(&meta(None, None, Some("ui.settings / save Dialog")))));
        assert!(!filter.matches(Some(&meta(None, None, Some("ui.settings only")))));
        assert!(!filter.matches(Some(&meta(None, None, None))));
    }

    #[test]
    fn required_properties_match_exactly() {
        let mut required = BTreeMap::new();
        required.insert("domain".to_string(), "legal".to_string());
        let filter = SearchFilter {
            required_properties: required,
            ..Default::default()
        };

        let mut accepted = meta(None, None, None);
        accepted.properties.insert("domain".into(), "legal".into());
        assert!(filter.matches(Some(&accepted)));

        let mut rejected = meta(None, None, None);
        rejected.properties.insert("domain".into(), "Legal".into());
        assert!(!filter.matches(Some(&rejected)));
    }

    #[test]
    fn provider_matches_segment_provenance() {
        let filter = SearchFilter {
            provider: Some("xliff".into()),
            ..Default::default()
        };
        let mut accepted = meta(None, None, None);
        accepted.segment = Some(SegmentProvenance {
            provider: "xliff".into(),
            ..Default::default()
        });
        assert!(filter.matches(Some(&accepted)));
        assert!(!filter.matches(Some(&meta(None, None, None))));
    }

    #[test]
    fn target_filter_covers_source_side_when_source_unset() {
        let target = SearchFilter {
            min_state: Some(WorkflowState::Final),
            ..Default::default()
        };
        let filters = TranslationFilters {
            source: None,
            target: Some(target.clone()),
        };
        assert_eq!(filters.source_side(), Some(&target));

        let explicit = TranslationFilters {
            source: Some(SearchFilter::default()),
            target: Some(target.clone()),
        };
        assert_eq!(explicit.source_side(), Some(&SearchFilter::default()));
    }
}
