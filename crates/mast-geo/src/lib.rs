pub mod doctor;
pub mod geo;
pub mod locator;
pub mod mast;

pub use geo::haversine_m;
pub use locator::{find_closest, Candidate};
pub use mast::{MastRecord, MastSnapshot};
