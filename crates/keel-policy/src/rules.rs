//! Label criteria and global rule evaluation.
//!
//! Global rules live in the system namespace or in the namespace of the service being claimed.
//! They are applied in `(weight, key)` order; each matching rule may set labels (visible to the
//! rules after it) or reject the claim, which stops evaluation.

use keel_core::{Criteria, Labels, ObjectKey, ObjectKind, Policy, Rule, SYSTEM_NAMESPACE};
use tracing::debug;

/// Check `criteria` against a label set.
///
/// `service` restricts matching to the listed services when given; ACL rule evaluation passes
/// `None` since there is no service involved.
pub fn criteria_matches(criteria: &Criteria, labels: &Labels, service: Option<&str>) -> bool {
    if let Some(service) = service {
        if !criteria.services.is_empty() && !criteria.services.iter().any(|s| s == service) {
            return false;
        }
    }

    let all = criteria
        .require_all
        .iter()
        .all(|(key, value)| label_matches(labels, key, value));
    let none = criteria
        .require_none
        .iter()
        .any(|(key, value)| label_matches(labels, key, value));

    all && !none
}

fn label_matches(labels: &Labels, key: &str, expected: &str) -> bool {
    match labels.get(key) {
        Some(actual) => expected == "*" || actual == expected,
        None => false,
    }
}

/// Result of running the global rules over one claim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleOutcome {
    /// Rules that matched, in application order.
    pub applied: Vec<ObjectKey>,
    /// The rule that rejected the claim, if any.
    pub rejected_by: Option<ObjectKey>,
}

impl RuleOutcome {
    pub fn is_rejected(&self) -> bool {
        self.rejected_by.is_some()
    }
}

/// Global rules visible from one namespace, in evaluation order.
pub struct RuleEvaluator<'a> {
    rules: Vec<&'a Rule>,
}

impl<'a> RuleEvaluator<'a> {
    /// Collect the rules of the system namespace and of `namespace`.
    pub fn new(policy: &'a Policy, namespace: &str) -> Self {
        let mut rules: Vec<&Rule> = policy
            .rules()
            .filter(|r| r.metadata.namespace == SYSTEM_NAMESPACE || r.metadata.namespace == namespace)
            .collect();
        rules.sort_by(|a, b| {
            a.weight
                .cmp(&b.weight)
                .then_with(|| a.metadata.namespace.cmp(&b.metadata.namespace))
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply the rules to `labels` in place for a claim on `service`.
    pub fn apply(&self, labels: &mut Labels, service: &str) -> RuleOutcome {
        let mut outcome = RuleOutcome::default();

        for rule in &self.rules {
            if !criteria_matches(&rule.criteria, labels, Some(service)) {
                continue;
            }

            let key = ObjectKey::new(
                rule.metadata.namespace.clone(),
                ObjectKind::Rule,
                rule.metadata.name.clone(),
            );
            debug!(rule = %key, service = service, "Global rule matched");

            for (k, v) in &rule.actions.set_labels {
                labels.insert(k.clone(), v.clone());
            }
            outcome.applied.push(key.clone());

            if rule.actions.reject {
                outcome.rejected_by = Some(key);
                break;
            }
        }

        outcome
    }
}
