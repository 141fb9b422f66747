pub mod account;
pub mod config;

pub use account::{Account, AccountPatch};
pub use config::{
    AppConfig, AuthConfig, ProxyRingConfig, ProxySource, SchedulerConfig, UpstreamConfig,
};
