//! Data models shared by the dispatch pipeline

mod frame;
mod health;
mod query;
mod result;

pub use frame::*;
pub use health::*;
pub use query::*;
pub use result::*;
