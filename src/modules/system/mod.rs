pub mod config;
pub mod lifecycle;
pub mod logger;
pub mod notifier;
pub mod scheduler;
pub mod validation;
