//! Trigger-code matching against value sets.
//!
//! Membership is decided only by codes explicitly enumerated in the value
//! set's `compose.include` groups. Exclude groups, filters and expansions are
//! not consulted, so value sets defined purely by filter never match.

use std::collections::BTreeSet;

use bsa_core::{CodeableConcept, Coding, ValueSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Which element of the resource the candidate code came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchElement {
    /// The resource's terminology `code` element.
    Code,
    /// A coded result such as `Observation.valueCodeableConcept`.
    Value,
}

/// Codes matched against one value set.
///
/// Code-element and value-element matches are kept apart; callers must not
/// merge the two sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedTriggerCodes {
    pub value_set_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_set_version: Option<String>,
    #[serde(default)]
    pub matched_codes: BTreeSet<String>,
    #[serde(default)]
    pub matched_values: BTreeSet<String>,
}

impl MatchedTriggerCodes {
    pub fn for_value_set(vs: &ValueSet) -> Self {
        Self {
            value_set_url: vs.label().to_string(),
            value_set_version: vs.version.clone(),
            matched_codes: BTreeSet::new(),
            matched_values: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.matched_codes.is_empty() && self.matched_values.is_empty()
    }

    pub fn same_value_set(&self, other: &Self) -> bool {
        self.value_set_url == other.value_set_url && self.value_set_version == other.value_set_version
    }

    pub fn add(&mut self, token: String, element: MatchElement) {
        match element {
            MatchElement::Code => self.matched_codes.insert(token),
            MatchElement::Value => self.matched_values.insert(token),
        };
    }

    /// Fold another result for the same value set into this one.
    pub fn absorb(&mut self, other: MatchedTriggerCodes) {
        self.matched_codes.extend(other.matched_codes);
        self.matched_values.extend(other.matched_values);
    }
}

/// Accumulated outcome of trigger-code checks for one action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerCodeStatus {
    pub trigger_matched: bool,
    #[serde(default)]
    pub matched_codes: Vec<MatchedTriggerCodes>,
}

impl TriggerCodeStatus {
    /// Record a match, merging with any earlier result for the same value set.
    pub fn add_matched(&mut self, matched: MatchedTriggerCodes) {
        if matched.is_empty() {
            return;
        }
        self.trigger_matched = true;
        match self.matched_codes.iter_mut().find(|m| m.same_value_set(&matched)) {
            Some(existing) => existing.absorb(matched),
            None => self.matched_codes.push(matched),
        }
    }

    pub fn merge(&mut self, other: TriggerCodeStatus) {
        for matched in other.matched_codes {
            self.add_matched(matched);
        }
    }

    /// All `system|code` tokens matched on code elements, across value sets.
    pub fn code_tokens(&self) -> BTreeSet<&str> {
        self.matched_codes
            .iter()
            .flat_map(|m| m.matched_codes.iter().map(String::as_str))
            .collect()
    }

    /// All `system|code` tokens matched on value elements, across value sets.
    pub fn value_tokens(&self) -> BTreeSet<&str> {
        self.matched_codes
            .iter()
            .flat_map(|m| m.matched_values.iter().map(String::as_str))
            .collect()
    }
}

/// Whether the value set explicitly enumerates `system|code`.
pub fn is_code_in_value_set(vs: &ValueSet, system: &str, code: &str) -> bool {
    vs.includes()
        .is_some_and(|groups| groups.iter().any(|g| g.enumerates(system, code)))
}

pub fn is_coding_in_value_set(vs: &ValueSet, coding: &Coding) -> bool {
    match (&coding.system, &coding.code) {
        (Some(system), Some(code)) => is_code_in_value_set(vs, system, code),
        _ => false,
    }
}

/// Match every coding of `candidate` against `vs`.
///
/// Matches from all codings accumulate into one result; `None` means no
/// coding matched (or the value set has nothing to match against).
pub fn match_code(
    vs: &ValueSet,
    candidate: &CodeableConcept,
    element: MatchElement,
) -> Option<MatchedTriggerCodes> {
    if vs.includes().is_none() {
        warn!(value_set = vs.label(), "Value set has no compose/include, cannot match codes");
        return None;
    }

    let mut matched = MatchedTriggerCodes::for_value_set(vs);
    for coding in &candidate.coding {
        if !is_coding_in_value_set(vs, coding) {
            continue;
        }
        if let Some(token) = coding.token() {
            debug!(value_set = vs.label(), code = %token, element = ?element, "Matched trigger code");
            matched.add(token, element);
        }
    }

    (!matched.is_empty()).then_some(matched)
}
