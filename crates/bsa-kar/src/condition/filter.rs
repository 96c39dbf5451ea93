use bsa_core::{DataRequirement, Resource, ValueSet};
use tracing::{debug, warn};

use crate::context::{DataSource, ProcessingContext};
use crate::matcher::{MatchElement, TriggerCodeStatus, match_code};

/// Select the context resources matching a requirement's code filters.
///
/// Only code-filterable resource kinds filtered on the `code` path are
/// considered. Observations additionally have `valueCodeableConcept` matched
/// as a value element. Missing filters, unresolvable value sets and other
/// configuration gaps yield no matches.
pub fn filter_resources(
    requirement: &DataRequirement,
    ctx: &ProcessingContext,
) -> (TriggerCodeStatus, Vec<Resource>) {
    let mut status = TriggerCodeStatus::default();
    let mut matched = Vec::new();

    if !requirement.has_code_filter() {
        debug!(requirement = %requirement.id, "Data requirement has no code filter");
        return (status, matched);
    }

    let value_sets = resolve_value_sets(requirement, ctx);
    if value_sets.is_empty() {
        return (status, matched);
    }

    for resource in ctx.resources_by_type(&requirement.resource_type) {
        if !resource.is_code_filterable() {
            debug!(
                requirement = %requirement.id,
                resource = %resource.key(),
                "Resource kind is not code-filterable, skipping"
            );
            continue;
        }

        let code = resource.primary_code();
        let value = match resource.resource_type() {
            "Observation" => resource.value_code(),
            _ => None,
        };

        let mut resource_matched = false;
        for vs in &value_sets {
            let candidates = [(code.as_ref(), MatchElement::Code), (value.as_ref(), MatchElement::Value)];
            for (concept, element) in candidates {
                let Some(concept) = concept else { continue };
                if let Some(m) = match_code(vs, concept, element) {
                    status.add_matched(m);
                    resource_matched = true;
                }
            }
        }

        if resource_matched {
            matched.push(resource.clone());
        }
    }

    debug!(
        requirement = %requirement.id,
        resource_type = %requirement.resource_type,
        matched = matched.len(),
        "Filtered resources by code"
    );
    (status, matched)
}

fn resolve_value_sets(requirement: &DataRequirement, ctx: &ProcessingContext) -> Vec<ValueSet> {
    let mut value_sets = Vec::new();
    for filter in &requirement.code_filter {
        if !filter.is_code_path() {
            warn!(
                requirement = %requirement.id,
                path = ?filter.path,
                "Code filter path is not supported, skipping"
            );
            continue;
        }
        let Some(reference) = filter.value_set.as_deref() else {
            warn!(requirement = %requirement.id, "Code filter has no value set, skipping");
            continue;
        };
        match ctx.repository().value_set(reference) {
            Ok(vs) => value_sets.push(vs),
            Err(e) => warn!(
                requirement = %requirement.id,
                value_set = reference,
                error = %e,
                "Value set not resolvable, skipping code filter"
            ),
        }
    }
    value_sets
}

/// Resources satisfying a requirement: code-filtered when it has a code
/// filter, otherwise every input resource of its type.
pub fn requirement_resources(requirement: &DataRequirement, ctx: &ProcessingContext) -> Vec<Resource> {
    if requirement.has_code_filter() {
        filter_resources(requirement, ctx).1
    } else {
        ctx.resources_by_type(&requirement.resource_type)
            .into_iter()
            .cloned()
            .collect()
    }
}
