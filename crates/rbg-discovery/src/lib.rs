//! Discovery configuration for RoleBasedGroups.
//!
//! This crate derives the topology of a [`RoleBasedGroup`](crd::RoleBasedGroup), keeps it
//! persisted in one discovery ConfigMap per role and injects it, together with group environment
//! variables and runtime profile sidecars, into the pod templates of the group's workloads.
//!
//! The entrypoint for controllers is [`injector::DefaultInjector`]:
//!
//! ```no_run
//! # async fn run(rbg: rbg_discovery::crd::RoleBasedGroup) -> Result<(), Box<dyn std::error::Error>> {
//! use rbg_discovery::{
//!     client::Client,
//!     injector::{DefaultInjector, GroupInfoInjector},
//! };
//!
//! let client = Client::new(kube::Client::try_default().await?, None);
//! let injector = DefaultInjector::from_client(client);
//!
//! for role in &rbg.spec.roles {
//!     let mut pod_template = Default::default();
//!     injector.inject(&mut pod_template, &rbg, role).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod client;
pub mod constants;
pub mod crd;
pub mod discovery;
pub mod env;
pub mod injector;
pub mod logging;
pub mod semantic;
pub mod sidecar;
pub mod topology;

// External re-exports
pub use k8s_openapi;
pub use kube;
pub use schemars;
