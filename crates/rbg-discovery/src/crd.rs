//! Custom resources consumed by the discovery engine.
//!
//! A [`RoleBasedGroup`] groups heterogeneous workloads (so called roles) that need to find each
//! other at runtime. Every role is backed by either a StatefulSet or a LeaderWorkerSet and can
//! reference reusable [`ClusterEngineRuntimeProfile`]s which contribute init containers, sidecar
//! containers and volumes to the role's pods.
//!
//! ```yaml
//! apiVersion: workloads.x-k8s.io/v1alpha1
//! kind: RoleBasedGroup
//! metadata:
//!   name: inference
//!   namespace: llm
//! spec:
//!   roles:
//!     - name: prefill
//!       replicas: 2
//!     - name: decode
//!       replicas: 1
//!       workload:
//!         kind: LeaderWorkerSet
//!       leaderWorkerSet:
//!         size: 4
//!       engineRuntimes:
//!         - profileName: patio-runtime
//!           containers:
//!             - name: patio-runtime
//!               args: ["--foo=bar"]
//! ```
use k8s_openapi::api::core::v1::{Container, EnvVar, Volume};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::constants::DEFAULT_NAMESPACE;

/// The workload API backing a role.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum WorkloadKind {
    /// Replica-set-like workload with stable network identities.
    #[default]
    StatefulSet,

    /// Leader/worker-set workload, where every replica is a group of one leader and
    /// `size - 1` workers.
    LeaderWorkerSet,
}

#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "workloads.x-k8s.io",
    version = "v1alpha1",
    kind = "RoleBasedGroup",
    plural = "rolebasedgroups",
    shortname = "rbg",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RoleBasedGroupSpec {
    /// The roles of this group. Role names must be unique within a group.
    #[serde(default)]
    pub roles: Vec<RoleSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    pub name: String,

    /// Number of replicas. Unset means one replica, an explicit `0` means the role has no
    /// addressable instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub workload: WorkloadSpec,

    /// Only evaluated for [`WorkloadKind::LeaderWorkerSet`] roles.
    #[serde(default)]
    pub leader_worker_set: LeaderWorkerTemplate,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub engine_runtimes: Vec<EngineRuntime>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Defaults to [`WorkloadKind::StatefulSet`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<WorkloadKind>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderWorkerTemplate {
    /// Number of pods per leader/worker group, leader included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,
}

/// A reference to a [`ClusterEngineRuntimeProfile`] plus role specific container overrides.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRuntime {
    pub profile_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerOverride>,
}

/// Overrides applied to the profile container called `name` once it is part of the pod.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverride {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

/// A reusable set of init containers, sidecar containers and volumes which roles can pull into
/// their pods by name.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "workloads.x-k8s.io",
    version = "v1alpha1",
    kind = "ClusterEngineRuntimeProfile",
    plural = "clusterengineruntimeprofiles"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEngineRuntimeProfileSpec {
    #[serde(default)]
    pub init_containers: Vec<Container>,

    #[serde(default)]
    pub containers: Vec<Container>,

    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl RoleBasedGroup {
    /// The namespace of the group, falling back to [`DEFAULT_NAMESPACE`].
    pub fn namespace_or_default(&self) -> String {
        self.namespace()
            .filter(|namespace| !namespace.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_owned())
    }

    /// The name shared by the workload, the headless service and the discovery ConfigMap of a
    /// role: `<group>-<role>`.
    pub fn workload_name(&self, role: &RoleSpec) -> String {
        format!("{group}-{role}", group = self.name_any(), role = role.name)
    }

    pub fn role(&self, name: &str) -> Option<&RoleSpec> {
        self.spec.roles.iter().find(|role| role.name == name)
    }
}

impl RoleSpec {
    pub fn workload_kind(&self) -> WorkloadKind {
        self.workload.kind.unwrap_or_default()
    }

    pub fn replicas_or_default(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }
}
