use const_format::concatcp;

/// The namespace used when a RoleBasedGroup does not carry one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// The name of the volume exposing the discovery ConfigMap to role containers.
pub const CLUSTER_CONFIG_VOLUME_NAME: &str = "rbg-cluster-config";

/// The directory the discovery volume is mounted at.
pub const CLUSTER_CONFIG_MOUNT_PATH: &str = "/etc/rbg";

/// The ConfigMap data key (and file name below [`CLUSTER_CONFIG_MOUNT_PATH`]) holding the
/// serialized [`ClusterConfig`](crate::topology::ClusterConfig).
pub const CLUSTER_CONFIG_KEY: &str = "config.yaml";

/// The full path role containers read the discovery payload from.
pub const CLUSTER_CONFIG_FILE: &str = concatcp!(CLUSTER_CONFIG_MOUNT_PATH, "/", CLUSTER_CONFIG_KEY);

/// The field manager used for server-side apply if none is configured.
pub const DEFAULT_FIELD_MANAGER: &str = "rolebasedgroup-controller";

/// Annotation key domains which are written by the platform itself. Annotations whose key prefix
/// ends with one of these domains never take part in semantic comparisons.
pub const SYSTEM_ANNOTATION_DOMAINS: &[&str] = &["kubernetes.io", "k8s.io"];

const LWS_KEY_PREFIX: &str = "leaderworkerset.sigs.k8s.io/";

/// Pod label set by the StatefulSet controller carrying the pod ordinal.
pub const STATEFUL_SET_POD_INDEX_LABEL: &str = "apps.kubernetes.io/pod-index";

/// Pod label set by the LeaderWorkerSet controller carrying the group (leader) ordinal.
pub const LWS_GROUP_INDEX_LABEL: &str = concatcp!(LWS_KEY_PREFIX, "group-index");

/// Pod label set by the LeaderWorkerSet controller carrying the worker ordinal within a group.
pub const LWS_WORKER_INDEX_LABEL: &str = concatcp!(LWS_KEY_PREFIX, "worker-index");
