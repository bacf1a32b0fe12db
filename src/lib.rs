pub mod cli;
pub mod engine;
pub mod stats;
pub mod utils;
pub mod vars;

pub use engine::{Engine, ExecRole, RunPlan};
pub use utils::parse_duration_str;
