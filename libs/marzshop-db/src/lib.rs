pub mod db;
pub mod models;
pub mod repositories;

pub use db::{Store, init_db, utc_now};
pub use sqlx;
