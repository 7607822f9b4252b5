pub mod db;
pub mod enums;
pub mod schema;
pub mod state;
