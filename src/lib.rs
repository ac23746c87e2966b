#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod gateway;
pub mod host;
pub mod index;
pub mod policy;
pub mod trigger;
pub mod validation;

pub use self::{
    gateway::Gateway,
    host::{HostSpecifier, InvalidHostSpecifier},
    index::Index,
    policy::Policy,
    trigger::{should_validate, InvalidRegexPattern, TriggerRule, TriggerRules},
    validation::{ConfigError, Validated},
};
pub use istio_config_k8s_api as k8s;
