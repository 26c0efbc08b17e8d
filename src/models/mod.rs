pub mod error_def;
pub mod monitor;

pub use error_def::{ErrorDefinition, StackFrame, StackTrace};
