pub mod config;
pub mod dispatch;
pub mod errors;
pub mod logging;
pub mod pacing;
pub mod patch;
pub mod pipeline;
pub mod platform;
pub mod report;
pub mod rewrite;
pub mod task;
pub mod ui;
pub mod workspace;
