//! Top-level facade crate for Chainward.
//!
//! Re-exports the core contracts and the kernel library so users can depend on a single crate.

pub mod core {
    pub use chainward_core::*;
}

pub mod kernel {
    pub use chainward_kernel::*;
}
