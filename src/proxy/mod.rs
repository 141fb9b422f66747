pub mod ring;
pub mod source;
pub mod upstream;

pub use ring::{ProxyEntry, ProxyRing};
pub use upstream::client::UpstreamClient;
