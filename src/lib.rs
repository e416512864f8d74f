pub mod config;
pub mod errors;
pub mod exclusion;
pub mod layout;
pub mod lock;
pub mod logging;
pub mod manifest;
pub mod merge;
pub mod paragraph;
pub mod phase;
pub mod pipeline;
pub mod rework;
pub mod status;
pub mod storage;
pub mod tools;
