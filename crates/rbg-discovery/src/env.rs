//! Environment variables describing a pod's place within its RoleBasedGroup.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodTemplateSpec,
};
use kube::ResourceExt;

use crate::{
    constants::{LWS_GROUP_INDEX_LABEL, LWS_WORKER_INDEX_LABEL, STATEFUL_SET_POD_INDEX_LABEL},
    crd::{RoleBasedGroup, RoleSpec, WorkloadKind},
};

pub const GROUP_NAME_ENV: &str = "GROUP_NAME";
pub const ROLE_NAME_ENV: &str = "ROLE_NAME";
pub const ROLE_SERVICE_NAME_ENV: &str = "ROLE_SERVICE_NAME";
pub const ROLE_INDEX_ENV: &str = "ROLE_INDEX";
pub const LWS_WORKER_INDEX_ENV: &str = "LWS_WORKER_INDEX";

/// The environment variables injected into every container of `role`.
pub fn build_env_vars(rbg: &RoleBasedGroup, role: &RoleSpec) -> Vec<EnvVar> {
    let mut env_vars = vec![
        env_var_from_value(GROUP_NAME_ENV, rbg.name_any()),
        env_var_from_value(ROLE_NAME_ENV, &role.name),
        env_var_from_value(ROLE_SERVICE_NAME_ENV, rbg.workload_name(role)),
    ];

    match role.workload_kind() {
        WorkloadKind::StatefulSet => {
            env_vars.push(env_var_from_pod_label(ROLE_INDEX_ENV, STATEFUL_SET_POD_INDEX_LABEL));
        }
        WorkloadKind::LeaderWorkerSet => {
            env_vars.push(env_var_from_pod_label(ROLE_INDEX_ENV, LWS_GROUP_INDEX_LABEL));
            env_vars.push(env_var_from_pod_label(LWS_WORKER_INDEX_ENV, LWS_WORKER_INDEX_LABEL));
        }
    }

    env_vars
}

/// Merges `env_vars` into every (non-init) container of `pod_template`.
pub fn inject_env_vars(pod_template: &mut PodTemplateSpec, env_vars: &[EnvVar]) {
    let Some(pod_spec) = pod_template.spec.as_mut() else {
        return;
    };

    for container in &mut pod_spec.containers {
        merge_container_env(container, env_vars);
    }
}

/// Merges `env_overrides` into the env of `container`, see [`insert_or_update_env_vars`].
pub fn merge_container_env(container: &mut Container, env_overrides: &[EnvVar]) {
    let env_vars = container.env.take().unwrap_or_default();
    container.env = Some(insert_or_update_env_vars(&env_vars, env_overrides));
}

/// Inserts or updates the EnvVars from `env_overrides` in `env_vars`.
///
/// The resulting EnvVars are sorted by name, so that the same set of variables always produces
/// the same pod template and does not trigger rolling restarts of the workload.
pub fn insert_or_update_env_vars(env_vars: &[EnvVar], env_overrides: &[EnvVar]) -> Vec<EnvVar> {
    let mut combined = BTreeMap::new();

    for env_var in env_vars.iter().chain(env_overrides) {
        combined.insert(env_var.name.to_owned(), env_var.to_owned());
    }

    combined.into_values().collect()
}

pub fn env_var_from_value(name: impl Into<String>, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

/// An EnvVar projecting the pod label `label` through the downward API.
pub fn env_var_from_pod_label(name: impl Into<String>, label: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: format!("metadata.labels['{label}']"),
                ..ObjectFieldSelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodSpec;
    use rstest::rstest;

    use super::*;
    use crate::crd::{RoleBasedGroupSpec, WorkloadSpec};

    fn names(env_vars: &[EnvVar]) -> Vec<&str> {
        env_vars.iter().map(|env_var| env_var.name.as_str()).collect()
    }

    fn pod_template(containers: Vec<Container>) -> PodTemplateSpec {
        PodTemplateSpec {
            spec: Some(PodSpec {
                containers,
                ..PodSpec::default()
            }),
            ..PodTemplateSpec::default()
        }
    }

    fn container(name: &str, env: Option<Vec<EnvVar>>) -> Container {
        Container {
            name: name.to_owned(),
            env,
            ..Container::default()
        }
    }

    #[rstest]
    #[case(None, vec!["GROUP_NAME", "ROLE_NAME", "ROLE_SERVICE_NAME", "ROLE_INDEX"])]
    #[case(
        Some(WorkloadKind::LeaderWorkerSet),
        vec!["GROUP_NAME", "ROLE_NAME", "ROLE_SERVICE_NAME", "ROLE_INDEX", "LWS_WORKER_INDEX"]
    )]
    fn env_vars_per_workload_kind(#[case] kind: Option<WorkloadKind>, #[case] expected: Vec<&str>) {
        let role = RoleSpec {
            name: "web".to_owned(),
            workload: WorkloadSpec { kind },
            ..RoleSpec::default()
        };
        let rbg = RoleBasedGroup::new(
            "test-group",
            RoleBasedGroupSpec {
                roles: vec![role.clone()],
            },
        );

        let env_vars = build_env_vars(&rbg, &role);
        assert_eq!(names(&env_vars), expected);
        assert_eq!(env_vars[0].value.as_deref(), Some("test-group"));
        assert_eq!(env_vars[1].value.as_deref(), Some("web"));
        assert_eq!(env_vars[2].value.as_deref(), Some("test-group-web"));

        let index_label = env_vars[3]
            .value_from
            .as_ref()
            .and_then(|source| source.field_ref.as_ref())
            .map(|field_ref| field_ref.field_path.as_str());
        let expected_label = match kind.unwrap_or_default() {
            WorkloadKind::StatefulSet => "metadata.labels['apps.kubernetes.io/pod-index']",
            WorkloadKind::LeaderWorkerSet => {
                "metadata.labels['leaderworkerset.sigs.k8s.io/group-index']"
            }
        };
        assert_eq!(index_label, Some(expected_label));
    }

    #[test]
    fn injected_value_wins_and_result_is_sorted() {
        let mut template = pod_template(vec![container(
            "main",
            Some(vec![
                env_var_from_value("ZED", "z"),
                env_var_from_value("FOO", "a"),
            ]),
        )]);

        inject_env_vars(
            &mut template,
            &[env_var_from_value("FOO", "b"), env_var_from_value("BAR", "c")],
        );

        let env = template.spec.as_ref().expect("spec set").containers[0]
            .env
            .clone()
            .expect("env set");
        assert_eq!(
            env,
            vec![
                env_var_from_value("BAR", "c"),
                env_var_from_value("FOO", "b"),
                env_var_from_value("ZED", "z"),
            ]
        );
    }

    #[test]
    fn injection_is_idempotent() {
        let env_vars = [
            env_var_from_value("GROUP_NAME", "g"),
            env_var_from_pod_label("ROLE_INDEX", STATEFUL_SET_POD_INDEX_LABEL),
        ];
        let mut once = pod_template(vec![
            container("a", None),
            container("b", Some(vec![env_var_from_value("X", "1")])),
        ]);
        inject_env_vars(&mut once, &env_vars);

        let mut twice = once.clone();
        inject_env_vars(&mut twice, &env_vars);

        assert_eq!(once, twice);
        for container in &once.spec.as_ref().expect("spec set").containers {
            assert!(names(container.env.as_deref().unwrap_or_default()).contains(&"ROLE_INDEX"));
        }
    }

    #[test]
    fn template_without_spec_is_left_alone() {
        let mut template = PodTemplateSpec::default();
        inject_env_vars(&mut template, &[env_var_from_value("FOO", "bar")]);
        assert_eq!(template, PodTemplateSpec::default());
    }
}
