mod time;
pub mod types;

pub use time::*;
pub use types::*;
