pub mod integrity;
pub mod operations;
