pub mod dsn;
pub mod protocol;
pub mod types;
