pub mod blob_store;
pub mod command;
pub mod compose;
pub mod echo;
pub mod engine;
pub mod host_keys;
pub mod inventory;
pub mod logger;
pub mod remote_configs;
pub mod settings;
pub mod shell;
pub mod ssh_session;
