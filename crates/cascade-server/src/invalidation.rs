use std::collections::{HashMap, HashSet};

use cascade_core::{DeletedEntity, Operation, QueryInvalidation, Result, TrackedEntity};
use serde_json::Value;
use tracing::debug;

/// Computes which client queries a mutation makes stale.
///
/// Failures never fail the mutation: the response builder logs them and
/// ships an empty invalidation list.
pub trait Invalidator: Send + Sync {
    fn compute(
        &self,
        updated: &[TrackedEntity],
        deleted: &[DeletedEntity],
        primary: &Value,
    ) -> Result<Vec<QueryInvalidation>>;
}

impl<F> Invalidator for F
where
    F: Fn(&[TrackedEntity], &[DeletedEntity], &Value) -> Result<Vec<QueryInvalidation>>
        + Send
        + Sync,
{
    fn compute(
        &self,
        updated: &[TrackedEntity],
        deleted: &[DeletedEntity],
        primary: &Value,
    ) -> Result<Vec<QueryInvalidation>> {
        self(updated, deleted, primary)
    }
}

/// Hints emitted for one typename. `{id}` in a query name or pattern is
/// replaced by the entity id.
#[derive(Debug, Clone, Default)]
pub struct InvalidationRules {
    pub on_create: Vec<QueryInvalidation>,
    pub on_update: Vec<QueryInvalidation>,
    pub on_delete: Vec<QueryInvalidation>,
}

impl InvalidationRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create(mut self, invalidation: QueryInvalidation) -> Self {
        self.on_create.push(invalidation);
        self
    }

    pub fn on_update(mut self, invalidation: QueryInvalidation) -> Self {
        self.on_update.push(invalidation);
        self
    }

    pub fn on_delete(mut self, invalidation: QueryInvalidation) -> Self {
        self.on_delete.push(invalidation);
        self
    }
}

/// Rule table keyed by typename, with an optional list-query convention:
/// creating or deleting a `Todo` invalidates the `todos` query.
#[derive(Debug, Clone, Default)]
pub struct RuleInvalidator {
    rules: HashMap<String, InvalidationRules>,
    list_query_convention: bool,
}

impl RuleInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(mut self, typename: impl Into<String>, rules: InvalidationRules) -> Self {
        self.rules.insert(typename.into(), rules);
        self
    }

    pub fn with_list_query_convention(mut self, enabled: bool) -> Self {
        self.list_query_convention = enabled;
        self
    }

    fn push_templates(
        out: &mut Vec<QueryInvalidation>,
        seen: &mut HashSet<QueryInvalidation>,
        templates: &[QueryInvalidation],
        id: &str,
    ) {
        for template in templates {
            let invalidation = QueryInvalidation {
                query_name: template.query_name.as_ref().map(|n| n.replace("{id}", id)),
                query_pattern: template
                    .query_pattern
                    .as_ref()
                    .map(|p| p.replace("{id}", id)),
                ..template.clone()
            };
            if seen.insert(invalidation.clone()) {
                out.push(invalidation);
            }
        }
    }

    fn push_convention(
        out: &mut Vec<QueryInvalidation>,
        seen: &mut HashSet<QueryInvalidation>,
        typename: &str,
    ) {
        let invalidation = QueryInvalidation::exact(list_query_name(typename));
        if seen.insert(invalidation.clone()) {
            out.push(invalidation);
        }
    }
}

impl Invalidator for RuleInvalidator {
    fn compute(
        &self,
        updated: &[TrackedEntity],
        deleted: &[DeletedEntity],
        _primary: &Value,
    ) -> Result<Vec<QueryInvalidation>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        for entity in updated {
            if let Some(rules) = self.rules.get(entity.typename()) {
                let templates = match entity.operation {
                    Operation::Created => &rules.on_create,
                    Operation::Updated => &rules.on_update,
                };
                Self::push_templates(&mut out, &mut seen, templates, entity.id());
            }
            if self.list_query_convention && entity.operation == Operation::Created {
                Self::push_convention(&mut out, &mut seen, entity.typename());
            }
        }

        for entity in deleted {
            if let Some(rules) = self.rules.get(entity.typename()) {
                Self::push_templates(&mut out, &mut seen, &rules.on_delete, entity.id());
            }
            if self.list_query_convention {
                Self::push_convention(&mut out, &mut seen, entity.typename());
            }
        }

        debug!(
            "Computed {} invalidations for {} updated / {} deleted entities",
            out.len(),
            updated.len(),
            deleted.len()
        );
        Ok(out)
    }
}

/// `Todo` -> `todos`, `Category` -> `categories`, `Address` -> `addresses`.
pub fn list_query_name(typename: &str) -> String {
    let mut chars = typename.chars();
    let mut name: String = match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => return String::new(),
    };

    let ends_with_consonant_y = name.ends_with('y')
        && !name
            .chars()
            .rev()
            .nth(1)
            .map(|c| "aeiou".contains(c))
            .unwrap_or(false);

    if ends_with_consonant_y {
        name.pop();
        name.push_str("ies");
    } else if ["s", "x", "z", "ch", "sh"].iter().any(|s| name.ends_with(s)) {
        name.push_str("es");
    } else {
        name.push('s');
    }
    name
}
