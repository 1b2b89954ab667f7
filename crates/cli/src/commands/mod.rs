pub mod config_cmd;
pub mod modifications;
pub mod pending;
pub mod run;
pub mod tools;
