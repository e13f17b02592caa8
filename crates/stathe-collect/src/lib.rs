pub mod load;

pub use load::{LoadCollector, parse_load, read_load};
