//! Controller core for volume populators.
//!
//! Watches user claims that point at a custom data-source kind, provisions a
//! shadow "prime" claim in the controller's working namespace, drives either
//! a data-transfer pod or caller-supplied provider callbacks, and finally
//! retargets the provisioned volume from the prime claim to the user's claim
//! before tearing the shadow objects down.

pub mod config;
mod context;
mod error;
mod events;
mod fabric;
mod finalizer;
pub mod grant;
mod http;
pub mod metrics;
mod pod;
pub mod provider;
mod queue;
mod reconcile;
mod router;
mod runtime;
mod writer;

#[cfg(test)]
mod test_support;

pub use config::PopulatorConfig;
pub use error::Error;
pub use grant::{GrantEvaluator, ReferenceGrant, ReferenceGrantEvaluator};
pub use provider::{ArgsFn, Backend, PopulatorParams, Provider};
pub use runtime::{run, run_with_client};

pub type Result<T> = std::result::Result<T, Error>;
