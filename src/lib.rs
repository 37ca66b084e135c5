pub mod dispatch;
pub mod error;
pub mod filter_inference;
pub mod filter_injection;
pub mod mem_engine;
pub mod placeholders;
pub mod table_store;
pub mod validator;
