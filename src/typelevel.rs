//! Module supporting type-level programming
//!
//! This is heavily inspired by the work in [`atsamd-rs`](https://github.com/atsamd-rs/atsamd).

mod private {
    /// Super trait used to mark traits with an exhaustive set of
    /// implementations
    pub trait Sealed {}
}

pub(crate) use private::Sealed;
