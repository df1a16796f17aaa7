pub mod command_handlers;
pub mod integrity;
pub mod operations;
pub mod query_handlers;
pub mod timeout;
