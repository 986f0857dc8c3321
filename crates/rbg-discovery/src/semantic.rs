//! Semantic comparison of discovery payloads and discovery ConfigMaps.
//!
//! Comparing the raw objects is not good enough: the API server adds bookkeeping fields, returns
//! owner references in arbitrary order and serializes empty collections inconsistently. Treating
//! any of that as a change would make every reconcile rewrite the ConfigMap.
//!
//! Two comparison modes are used:
//!
//! * sequences are compared element by element, so order matters (roles, role names),
//! * keyed sets are sorted by a stable key before being compared (owner references by uid).
//!
//! In both modes an absent collection equals an empty one.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display},
};

use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::OwnerReference};
use serde::Serialize;
use serde_json::Value;

use crate::{constants::SYSTEM_ANNOTATION_DOMAINS, topology::ClusterConfig};

const NULL: &Value = &Value::Null;

/// The outcome of a semantic comparison. No differences means the compared objects are equal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Comparison {
    differences: Vec<String>,
}

impl Comparison {
    pub fn is_equal(&self) -> bool {
        self.differences.is_empty()
    }

    pub fn differences(&self) -> &[String] {
        &self.differences
    }

    fn push(&mut self, difference: impl Into<String>) {
        self.differences.push(difference.into());
    }

    fn compare_serialized<T: Serialize>(&mut self, path: &str, old: &T, new: &T) {
        match (serde_json::to_value(old), serde_json::to_value(new)) {
            (Ok(old), Ok(new)) => self.compare_values(path, &old, &new),
            (Err(err), _) | (_, Err(err)) => {
                self.push(format!("{path}: not comparable: {err}"));
            }
        }
    }

    fn compare_values(&mut self, path: &str, old: &Value, new: &Value) {
        if is_empty(old) && is_empty(new) {
            return;
        }

        match (old, new) {
            (Value::Object(old), Value::Object(new)) => {
                let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
                for key in keys {
                    self.compare_values(
                        &join(path, key),
                        old.get(key).unwrap_or(NULL),
                        new.get(key).unwrap_or(NULL),
                    );
                }
            }
            (Value::Array(old), Value::Array(new)) => self.compare_sequence(path, old, new),
            // An empty collection on one side and null on the other was handled above, so a
            // lone null still has to be compared against a non-empty value
            (Value::Null, Value::Array(new)) => self.compare_sequence(path, &[], new),
            (Value::Array(old), Value::Null) => self.compare_sequence(path, old, &[]),
            (old, new) if old == new => {}
            (old, new) => self.push(format!("{path}: {old} -> {new}")),
        }
    }

    /// Order sensitive: the n-th element of `old` is compared with the n-th element of `new`.
    fn compare_sequence(&mut self, path: &str, old: &[Value], new: &[Value]) {
        if old.len() != new.len() {
            self.push(format!(
                "{path}: length {old_len} -> {new_len}",
                old_len = old.len(),
                new_len = new.len()
            ));
        }

        for index in 0..old.len().max(new.len()) {
            self.compare_values(
                &format!("{path}[{index}]"),
                old.get(index).unwrap_or(NULL),
                new.get(index).unwrap_or(NULL),
            );
        }
    }

    /// Order insensitive: both sides are sorted by `key` first, then compared as sequences.
    fn compare_keyed_set<T, K, F>(&mut self, path: &str, old: &[T], new: &[T], key: F)
    where
        T: Serialize,
        K: Ord,
        F: Fn(&T) -> K,
    {
        self.compare_serialized(path, &sorted_by(old, &key), &sorted_by(new, &key));
    }
}

impl Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.differences.join("\n"))
    }
}

/// Compares two discovery payloads.
///
/// Role order is part of the payload (it is sorted by the builder), so two configs listing the
/// same roles in a different order are *not* equal.
pub fn compare_cluster_configs(
    old: Option<&ClusterConfig>,
    new: Option<&ClusterConfig>,
) -> Comparison {
    let mut comparison = Comparison::default();
    match (old, new) {
        (None, None) => {}
        (None, Some(_)) => comparison.push("old is absent"),
        (Some(_), None) => comparison.push("new is absent"),
        (Some(old), Some(new)) => comparison.compare_serialized("", old, new),
    }
    comparison
}

/// Compares two discovery ConfigMaps, ignoring everything the API server manages on its own.
pub fn compare_config_maps(old: Option<&ConfigMap>, new: Option<&ConfigMap>) -> Comparison {
    let mut comparison = Comparison::default();
    let (old, new) = match (old, new) {
        (None, None) => return comparison,
        (None, Some(_)) => {
            comparison.push("old is absent");
            return comparison;
        }
        (Some(_), None) => {
            comparison.push("new is absent");
            return comparison;
        }
        (Some(old), Some(new)) => (without_server_fields(old), without_server_fields(new)),
    };

    let (old, old_owner_references) = take_owner_references(old);
    let (new, new_owner_references) = take_owner_references(new);

    comparison.compare_keyed_set(
        "metadata.ownerReferences",
        &old_owner_references,
        &new_owner_references,
        |owner_reference| owner_reference.uid.clone(),
    );
    comparison.compare_serialized("", &old, &new);
    comparison
}

/// Removes annotations which are maintained by the platform rather than by us.
pub fn filter_system_annotations(
    annotations: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    annotations.map(|annotations| {
        annotations
            .into_iter()
            .filter(|(key, _)| !is_system_annotation(key))
            .collect()
    })
}

fn is_system_annotation(key: &str) -> bool {
    let Some((prefix, _)) = key.split_once('/') else {
        return false;
    };

    SYSTEM_ANNOTATION_DOMAINS.iter().any(|domain| {
        prefix
            .strip_suffix(domain)
            .is_some_and(|rest| rest.is_empty() || rest.ends_with('.'))
    })
}

fn without_server_fields(config_map: &ConfigMap) -> ConfigMap {
    let mut config_map = config_map.clone();
    let metadata = &mut config_map.metadata;

    metadata.resource_version = None;
    metadata.uid = None;
    metadata.creation_timestamp = None;
    metadata.generation = None;
    metadata.managed_fields = None;
    metadata.self_link = None;
    metadata.annotations = filter_system_annotations(metadata.annotations.take());

    config_map
}

fn take_owner_references(mut config_map: ConfigMap) -> (ConfigMap, Vec<OwnerReference>) {
    let owner_references = config_map
        .metadata
        .owner_references
        .take()
        .unwrap_or_default();
    (config_map, owner_references)
}

fn sorted_by<'a, T, K: Ord>(items: &'a [T], key: &impl Fn(&T) -> K) -> Vec<&'a T> {
    let mut items: Vec<&T> = items.iter().collect();
    items.sort_by_key(|item| key(*item));
    items
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_owned()
    } else {
        format!("{path}.{key}")
    }
}
