pub mod broker;
pub mod challenge;
pub mod lifecycle;
