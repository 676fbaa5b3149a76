#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use gefyra_operator_core as core;
pub use gefyra_operator_k8s_api as k8s;
pub use gefyra_operator_k8s_carrier as carrier;
pub use gefyra_operator_k8s_stowaway as stowaway;

mod admission;
mod args;
mod config;
mod controller;
mod credentials;
mod events;
mod metrics;
mod persist;
mod providers;
mod startup;
mod validation;
mod wireguard;

pub use self::{
    args::Args, config::OperatorConfig, controller::FINALIZER, credentials::account_name,
    providers::Providers,
};
