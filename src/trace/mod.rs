pub mod capture;
pub mod coordinator;
pub mod engine;

pub use capture::*;
pub use coordinator::*;
pub use engine::*;
