//! Routing: rules, geo databases and the router itself

pub mod geo;
pub mod matcher;
pub mod rule;
mod router;

pub use geo::{GeoIpReader, GeositeReader};
pub use rule::{DefaultRule, DnsRule, Rule};
pub use router::{Router, RouterBuilder};
