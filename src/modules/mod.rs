pub mod auth;
pub mod persistence;
pub mod system;
