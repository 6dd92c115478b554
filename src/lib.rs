// Library for tests to access modules

pub mod api;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod load_sampler;
pub mod metrics;
pub mod models;
pub mod portforward;
pub mod scheduler;
pub mod subscriber;
pub mod version;
pub mod wireguard;
