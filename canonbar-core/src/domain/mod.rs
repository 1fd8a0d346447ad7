//! Core domain types: assets, raw and canonical records, keys, day ranges.

pub mod asset;
pub mod ids;
pub mod range;
pub mod record;

pub use asset::{Asset, AssetType};
pub use ids::{AssetId, DayKey, SourceId, TaskKey};
pub use range::{DayRange, RangeError};
pub use record::{CanonicalRecord, Observation, RawRecord};
