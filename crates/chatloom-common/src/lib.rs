pub mod error;
pub mod ids;

pub use error::{Error, Result};
pub use ids::{new_id, now_timestamp, parse_id, short_id};
