mod database;
mod error;
mod row_helpers;
mod schema;

pub mod instances;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
