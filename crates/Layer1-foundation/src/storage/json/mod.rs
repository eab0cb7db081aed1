mod atomic;
mod store;

pub use atomic::write_atomic;
pub use store::JsonStore;
