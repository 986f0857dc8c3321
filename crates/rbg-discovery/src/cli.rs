use clap::Args;

use crate::{client::Client, constants::DEFAULT_FIELD_MANAGER};

/// CLI arguments of the discovery engine, meant to be flattened into the run arguments of the
/// controller embedding it.
#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Discovery Options")]
pub struct DiscoveryOptions {
    /// The field manager used for server-side apply of discovery ConfigMaps.
    #[arg(long, env, default_value = DEFAULT_FIELD_MANAGER)]
    pub field_manager: String,
}

impl DiscoveryOptions {
    /// Wraps `client` into a [`Client`] applying with the configured field manager.
    pub fn client(&self, client: kube::Client) -> Client {
        Client::new(client, Some(self.field_manager.clone()))
    }
}
