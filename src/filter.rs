use crate::config::SelectionConfig;
use crate::fips::StateIndex;
use crate::geography::StateLabel;
use crate::types::GeoFeature;
use std::collections::HashSet;
use tracing::debug;

/// A resolved state selection. Names that are not in the state table are
/// dropped from the filter rather than reported as errors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateFilter {
    allowed: Option<HashSet<String>>,
    unresolved: Vec<String>,
    hide_other_states: bool,
}

impl StateFilter {
    pub fn new(selection: &SelectionConfig, index: &StateIndex) -> Self {
        let Some(names) = &selection.states else {
            return StateFilter::default();
        };

        let mut allowed = HashSet::with_capacity(names.len());
        let mut unresolved = Vec::new();
        for name in names {
            match index.state_name_to_fips(name) {
                Some(fips) => {
                    allowed.insert(fips);
                }
                None => {
                    debug!("state {name:?} is not in the state table, ignoring it");
                    unresolved.push(name.clone());
                }
            }
        }

        StateFilter {
            allowed: Some(allowed),
            unresolved,
            hide_other_states: selection.hide_other_states,
        }
    }

    /// True when a selection was supplied, even if none of it resolved.
    pub fn is_active(&self) -> bool {
        self.allowed.is_some()
    }

    pub fn hides_other_states(&self) -> bool {
        self.is_active() && self.hide_other_states
    }

    /// Selected names that matched no state.
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

    /// Whether a 2-digit state code passes the filter.
    pub fn allows_state(&self, state_fips: &str) -> bool {
        self.allowed
            .as_ref()
            .map_or(true, |allowed| allowed.contains(state_fips))
    }

    /// Counties whose parent state is selected; everything when no
    /// selection is active.
    pub fn filter_features<'a>(&self, counties: &'a [GeoFeature]) -> Vec<&'a GeoFeature> {
        counties
            .iter()
            .filter(|county| self.allows_state(county.state_fips()))
            .collect()
    }

    /// State outlines to draw. Only narrowed when the selection asks to hide
    /// the other states.
    pub fn filter_state_outlines<'a>(&self, states: &'a [GeoFeature]) -> Vec<&'a GeoFeature> {
        if !self.hides_other_states() {
            return states.iter().collect();
        }
        states
            .iter()
            .filter(|state| self.allows_state(&state.id))
            .collect()
    }

    /// Features the projection should be fit to: the selected states when
    /// filtering is active, otherwise every state.
    pub fn extent_features<'a>(&self, states: &'a [GeoFeature]) -> Vec<&'a GeoFeature> {
        states
            .iter()
            .filter(|state| self.allows_state(&state.id))
            .collect()
    }

    pub fn filter_labels(&self, labels: Vec<StateLabel>) -> Vec<StateLabel> {
        labels
            .into_iter()
            .filter(|label| self.allows_state(&label.fips))
            .collect()
    }
}
