pub mod dhan;

pub use dhan::{DhanClient, Profile};
