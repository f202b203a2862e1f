//! Command implementations for dsq

pub mod datasources;
pub mod health;
pub mod query;
pub mod resource;

pub use datasources::datasources;
pub use health::health;
pub use query::{query, QueryArgs};
pub use resource::resource;
