// Risk management module
pub mod controller;

pub use controller::{EntryVeto, PriceLevels, RiskController, RiskError};
