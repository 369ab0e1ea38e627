#![forbid(unsafe_code)]

mod env_pointers;
mod logs;
mod pending_inputs;
mod runs;

pub use env_pointers::*;
pub use logs::*;
pub use pending_inputs::*;
pub use runs::*;
