//! Small library of general-purpose operators.

mod cache;
mod piper;
mod pointwise;

pub use cache::OpArrayCache;
pub use piper::OpArrayPiper;
pub use pointwise::OpPointwise;
