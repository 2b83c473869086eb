pub mod time;

pub use time::{from_millis, parse_provider_timestamp, time_bucket};
