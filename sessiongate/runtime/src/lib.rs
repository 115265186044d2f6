#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use sessiongate_controller as controller;
pub use sessiongate_core as core;
pub use sessiongate_k8s_api as k8s;
pub use sessiongate_registry as registry;

mod args;
mod config;
mod lease;

pub use self::{
    args::Args,
    config::{ControllerArgs, ControllerConfig, LeaderConfig},
};
