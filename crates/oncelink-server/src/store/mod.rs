pub mod db;
pub mod model;

pub use db::{Store, DEFAULT_TABLE};
pub use model::SecretRecord;
