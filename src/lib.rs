pub mod app;
pub mod browser;
pub mod ca;
pub mod config;
pub mod enrollment;
pub mod logging;
pub mod naming;
pub mod onboarding;
pub mod pac;
pub mod platform;
pub mod probe;
pub mod store;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
