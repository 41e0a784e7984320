mod executor;
pub mod manifest;
mod session;

pub use executor::SandboxExecutor;
pub use session::{SandboxError, SandboxSession};
