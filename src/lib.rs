//! Recover the volumes of a UBI image from a raw flash dump.
//!
//! See the [ubi] module for how this works.

pub mod ubi;
pub mod util;
