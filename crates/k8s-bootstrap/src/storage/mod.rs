//! Persistence for the bootstrap document.

mod local;
mod traits;

pub use local::LocalStore;
pub use traits::Storage;
