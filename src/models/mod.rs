//! Data model types shared across the proxy

mod record;
mod upstream;

pub use record::{RelayOutcome, RelayRecord};
pub use upstream::{UpstreamProtocol, UpstreamProxy};
