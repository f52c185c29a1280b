pub mod availability;
pub mod config;
pub mod error;
pub mod types;

pub use availability::AvailabilityMap;
pub use error::{VaultError, VaultResult};
pub use types::{Bitfield, CtHash, PathId};
