//! Derives the canonical cluster topology ([`ClusterConfig`]) of a [`RoleBasedGroup`].
//!
//! The topology is serialized to YAML and mounted into every role pod (see
//! [`CLUSTER_CONFIG_FILE`](crate::constants::CLUSTER_CONFIG_FILE)), so that roles can find each
//! other without talking to the Kubernetes API:
//!
//! ```yaml
//! group:
//!   name: test-group
//!   namespace: test-ns
//!   roleNames:
//!   - web
//! roles:
//! - name: web
//!   type: StatefulSet
//!   service: test-group-web
//!   replicas: 3
//!   startIndex: 0
//! ```
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::crd::{RoleBasedGroup, WorkloadKind};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize cluster config"))]
    SerializeClusterConfig { source: serde_yaml::Error },

    #[snafu(display("failed to deserialize cluster config"))]
    DeserializeClusterConfig { source: serde_yaml::Error },
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub group: GroupInfo,

    /// Sorted by role name, so that reordering roles in the group spec yields the same payload.
    #[serde(default)]
    pub roles: Vec<RoleInfo>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub name: String,
    pub namespace: String,

    /// Role names in declaration order.
    #[serde(default)]
    pub role_names: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleInfo {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: WorkloadKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_template: Option<String>,

    pub replicas: i32,

    /// Pods per leader/worker group, only present for LeaderWorkerSet roles that declare it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lws_workers: Option<i32>,

    /// Ordinal of the first addressable instance, `-1` if the role has no instances.
    pub start_index: i32,
}

impl ClusterConfig {
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context(SerializeClusterConfigSnafu)
    }

    pub fn from_yaml(input: &str) -> Result<Self> {
        serde_yaml::from_str(input).context(DeserializeClusterConfigSnafu)
    }
}

/// Builds the [`ClusterConfig`] of `rbg`.
///
/// This is a pure function of the group spec: it never looks at previously persisted state, and
/// calling it twice with the same input yields byte-identical YAML.
pub fn build_cluster_config(rbg: &RoleBasedGroup) -> ClusterConfig {
    let role_names = rbg.spec.roles.iter().map(|role| role.name.clone()).collect();

    let mut roles: Vec<RoleInfo> = rbg
        .spec
        .roles
        .iter()
        .map(|role| {
            let kind = role.workload_kind();
            let replicas = role.replicas_or_default();

            let lws_workers = match kind {
                WorkloadKind::StatefulSet => None,
                WorkloadKind::LeaderWorkerSet => role.leader_worker_set.size,
            };

            RoleInfo {
                name: role.name.clone(),
                kind,
                // Both workload kinds are fronted by a headless service named after the workload
                service: Some(rbg.workload_name(role)),
                service_template: None,
                replicas,
                lws_workers,
                start_index: if replicas == 0 { -1 } else { 0 },
            }
        })
        .collect();
    roles.sort_by(|a, b| a.name.cmp(&b.name));

    ClusterConfig {
        group: GroupInfo {
            name: rbg.name_any(),
            namespace: rbg.namespace_or_default(),
            role_names,
        },
        roles,
    }
}
