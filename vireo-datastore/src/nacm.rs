//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};

use vireo_utils::yang::DataNodeRefExt;
use yang3::data::{Data, DataTree};

/// NACM access operations (RFC 8341, section 3.2.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    Create,
    Read,
    Update,
    Delete,
    Exec,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuleAction {
    Permit,
    Deny,
}

#[derive(Clone, Debug)]
pub struct Rule {
    pub name: String,
    pub module_name: String,
    pub access_operations: String,
    pub action: RuleAction,
    pub path: Option<String>,
    pub rpc_name: Option<String>,
    pub notification_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RuleList {
    pub name: String,
    pub groups: Vec<String>,
    pub rules: Vec<Rule>,
}

/// Parsed representation of the `/ietf-netconf-acm:nacm` subtree.
///
/// Rebuilt from the running datastore whenever a transaction touches the
/// `ietf-netconf-acm` module.
#[derive(Clone, Debug)]
pub struct NacmRules {
    pub enabled: bool,
    pub read_default: RuleAction,
    pub write_default: RuleAction,
    pub exec_default: RuleAction,
    // group name -> member user names
    pub groups: BTreeMap<String, BTreeSet<String>>,
    pub rule_lists: Vec<RuleList>,
}

// ===== impl Access =====

impl Access {
    fn as_str(&self) -> &'static str {
        match self {
            Access::Create => "create",
            Access::Read => "read",
            Access::Update => "update",
            Access::Delete => "delete",
            Access::Exec => "exec",
        }
    }
}

// ===== impl Rule =====

impl Rule {
    // Checks whether the rule covers the given access operation.
    fn matches_access(&self, access: Access) -> bool {
        self.access_operations == "*"
            || self
                .access_operations
                .split_whitespace()
                .any(|op| op == access.as_str())
    }

    // Checks whether the rule covers the given module.
    fn matches_module(&self, module: &str) -> bool {
        self.module_name == "*" || self.module_name == module
    }

    // Checks whether the rule covers the given data path. A data-node rule
    // matches the node it names and everything below it.
    fn matches_path(&self, path: Option<&str>) -> bool {
        match (&self.path, path) {
            (Some(rule_path), Some(path)) => path.starts_with(rule_path),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

// ===== impl NacmRules =====

impl NacmRules {
    /// Parses the NACM configuration out of a running-datastore tree.
    pub fn from_data(tree: &DataTree<'static>) -> NacmRules {
        let mut rules = NacmRules::default();

        let Ok(Some(nacm)) = tree
            .find_xpath("/ietf-netconf-acm:nacm")
            .map(|mut iter| iter.next())
        else {
            return rules;
        };

        // A nacm container materialized purely out of schema defaults means
        // access control was never configured.
        if nacm.is_default() {
            return rules;
        }
        rules.enabled = true;

        if let Some(enabled) = nacm.get_bool_relative("enable-nacm") {
            rules.enabled = enabled;
        }
        if let Some(action) = nacm.get_string_relative("read-default") {
            rules.read_default = action_from_str(&action);
        }
        if let Some(action) = nacm.get_string_relative("write-default") {
            rules.write_default = action_from_str(&action);
        }
        if let Some(action) = nacm.get_string_relative("exec-default") {
            rules.exec_default = action_from_str(&action);
        }

        for group in nacm.find_xpath("groups/group").into_iter().flatten() {
            let name = group
                .get_string_relative("name")
                .unwrap_or_default();
            let members = group
                .find_xpath("user-name")
                .into_iter()
                .flatten()
                .map(|dnode| dnode.get_string())
                .collect();
            rules.groups.insert(name, members);
        }

        for rule_list in nacm.find_xpath("rule-list").into_iter().flatten() {
            let name = rule_list
                .get_string_relative("name")
                .unwrap_or_default();
            let groups = rule_list
                .find_xpath("group")
                .into_iter()
                .flatten()
                .map(|dnode| dnode.get_string())
                .collect();
            let mut parsed_rules = Vec::new();
            for rule in rule_list.find_xpath("rule").into_iter().flatten() {
                parsed_rules.push(Rule {
                    name: rule
                        .get_string_relative("name")
                        .unwrap_or_default(),
                    module_name: rule
                        .get_string_relative("module-name")
                        .unwrap_or_else(|| "*".to_owned()),
                    access_operations: rule
                        .get_string_relative("access-operations")
                        .unwrap_or_else(|| "*".to_owned()),
                    action: rule
                        .get_string_relative("action")
                        .map(|action| action_from_str(&action))
                        .unwrap_or(RuleAction::Deny),
                    path: rule.get_string_relative("path"),
                    rpc_name: rule.get_string_relative("rpc-name"),
                    notification_name: rule
                        .get_string_relative("notification-name"),
                });
            }
            rules.rule_lists.push(RuleList {
                name,
                groups,
                rules: parsed_rules,
            });
        }

        rules
    }

    /// Returns the groups the given user belongs to.
    pub fn user_groups(&self, user: &str) -> BTreeSet<&str> {
        self.groups
            .iter()
            .filter(|(_, members)| members.contains(user))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Evaluates an access request per RFC 8341, section 3.4.4 (module and
    /// data-node rule granularity).
    pub fn check(
        &self,
        user: &str,
        access: Access,
        module: &str,
        path: Option<&str>,
    ) -> bool {
        if !self.enabled {
            return true;
        }

        let groups = self.user_groups(user);
        for rule_list in self
            .rule_lists
            .iter()
            .filter(|rule_list| {
                rule_list.groups.iter().any(|group| {
                    group == "*" || groups.contains(group.as_str())
                })
            })
        {
            for rule in rule_list.rules.iter() {
                if rule.matches_module(module)
                    && rule.matches_access(access)
                    && rule.matches_path(path)
                {
                    return rule.action == RuleAction::Permit;
                }
            }
        }

        // No rule matched; fall back to the global defaults.
        let action = match access {
            Access::Read => self.read_default,
            Access::Exec => self.exec_default,
            Access::Create | Access::Update | Access::Delete => {
                self.write_default
            }
        };
        action == RuleAction::Permit
    }
}

impl Default for NacmRules {
    fn default() -> NacmRules {
        NacmRules {
            enabled: false,
            read_default: RuleAction::Permit,
            write_default: RuleAction::Deny,
            exec_default: RuleAction::Permit,
            groups: Default::default(),
            rule_lists: Default::default(),
        }
    }
}

// ===== helper functions =====

fn action_from_str(action: &str) -> RuleAction {
    match action {
        "permit" => RuleAction::Permit,
        _ => RuleAction::Deny,
    }
}
