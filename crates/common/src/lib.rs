pub mod config;
pub mod db;
pub mod num;
pub mod observability;
pub mod types;
pub mod upstream;
