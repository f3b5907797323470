//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::debug;
use vireo_datastore::nacm::{NacmRules, Rule, RuleAction};

/// Validates that the NACM rules permit anonymous user access:
///
/// The first rule-list element contains the rules for anonymous access,
/// i.e.:
///  - its group set names the anonymous group,
///  - every rule except the last allows only the "read" operation,
///  - the last rule has module-name "*" and action "deny".
///
/// Any other configuration disables anonymous access. Only the first
/// rule-list is ever examined; later rule-lists cannot re-enable it.
pub fn valid_anonymous_nacm_rules(
    rules: &NacmRules,
    anon_group: &str,
) -> bool {
    if !rules.enabled {
        debug!("NACM config validation: no usable NACM data");
        return false;
    }

    let Some(rule_list) = rules.rule_lists.first() else {
        debug!("NACM config validation: no rule-list entries");
        return false;
    };

    if !rule_list.groups.iter().any(|group| group == anon_group) {
        debug!(
            "NACM config validation: first rule-list doesn't contain the \
             anonymous user's group"
        );
        return false;
    }

    let Some((last, others)) = rule_list.rules.split_last() else {
        debug!(
            "NACM config validation: first rule-list doesn't contain any \
             rules"
        );
        return false;
    };

    if !others.iter().all(is_rule_read_only) {
        debug!(
            "NACM config validation: first n-1 rules of the anonymous \
             rule-list must be configured for read access only"
        );
        return false;
    }

    if !is_rule_wildcard_deny(last) {
        debug!(
            "NACM config validation: last rule of the anonymous rule-list \
             must deny all access to all modules"
        );
        return false;
    }

    true
}

// ===== helper functions =====

fn is_rule_read_only(rule: &Rule) -> bool {
    !rule.access_operations.is_empty()
        && rule
            .access_operations
            .split_whitespace()
            .all(|operation| operation == "read")
}

fn is_rule_wildcard_deny(rule: &Rule) -> bool {
    rule.action == RuleAction::Deny && rule.module_name == "*"
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use vireo_datastore::nacm::RuleList;

    use super::*;

    fn rule(
        name: &str,
        module: &str,
        access: &str,
        action: RuleAction,
    ) -> Rule {
        Rule {
            name: name.to_owned(),
            module_name: module.to_owned(),
            access_operations: access.to_owned(),
            action,
            path: None,
            rpc_name: None,
            notification_name: None,
        }
    }

    fn rules_with(rule_lists: Vec<RuleList>) -> NacmRules {
        NacmRules {
            enabled: true,
            rule_lists,
            ..Default::default()
        }
    }

    fn anonymous_rule_list(rules: Vec<Rule>) -> RuleList {
        RuleList {
            name: "anon".to_owned(),
            groups: vec!["yangnobody".to_owned()],
            rules,
        }
    }

    #[test]
    fn valid_configuration() {
        let rules = rules_with(vec![anonymous_rule_list(vec![
            rule("r1", "example", "read", RuleAction::Permit),
            rule("r2", "ietf-system", "read", RuleAction::Permit),
            rule("deny", "*", "*", RuleAction::Deny),
        ])]);
        assert!(valid_anonymous_nacm_rules(&rules, "yangnobody"));
    }

    #[test]
    fn no_rules_at_all() {
        assert!(!valid_anonymous_nacm_rules(
            &NacmRules::default(),
            "yangnobody"
        ));
        assert!(!valid_anonymous_nacm_rules(
            &rules_with(vec![]),
            "yangnobody"
        ));
    }

    #[test]
    fn wrong_group() {
        let rules = rules_with(vec![RuleList {
            name: "anon".to_owned(),
            groups: vec!["operators".to_owned()],
            rules: vec![rule("deny", "*", "*", RuleAction::Deny)],
        }]);
        assert!(!valid_anonymous_nacm_rules(&rules, "yangnobody"));
    }

    #[test]
    fn write_rule_disables_anonymous_access() {
        let rules = rules_with(vec![anonymous_rule_list(vec![
            rule("rw", "example", "read update", RuleAction::Permit),
            rule("deny", "*", "*", RuleAction::Deny),
        ])]);
        assert!(!valid_anonymous_nacm_rules(&rules, "yangnobody"));
    }

    #[test]
    fn missing_wildcard_deny() {
        let rules = rules_with(vec![anonymous_rule_list(vec![rule(
            "r1",
            "example",
            "read",
            RuleAction::Permit,
        )])]);
        assert!(!valid_anonymous_nacm_rules(&rules, "yangnobody"));

        let rules = rules_with(vec![anonymous_rule_list(vec![
            rule("r1", "example", "read", RuleAction::Permit),
            rule("last", "example", "*", RuleAction::Deny),
        ])]);
        assert!(!valid_anonymous_nacm_rules(&rules, "yangnobody"));
    }

    #[test]
    fn only_first_rule_list_counts() {
        // A valid anonymous rule-list in second position doesn't help.
        let first = RuleList {
            name: "admins".to_owned(),
            groups: vec!["admins".to_owned()],
            rules: vec![rule("all", "*", "*", RuleAction::Permit)],
        };
        let second = anonymous_rule_list(vec![
            rule("r1", "example", "read", RuleAction::Permit),
            rule("deny", "*", "*", RuleAction::Deny),
        ]);
        let rules = rules_with(vec![first, second]);
        assert!(!valid_anonymous_nacm_rules(&rules, "yangnobody"));
    }
}
