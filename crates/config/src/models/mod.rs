pub mod app_config;
pub mod logging;
pub mod scheduler;

pub use app_config::*;
pub use logging::*;
pub use scheduler::*;
