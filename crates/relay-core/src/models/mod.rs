pub mod checkpoint;
pub mod instance;
pub mod verification;

pub use checkpoint::*;
pub use instance::*;
pub use verification::*;
