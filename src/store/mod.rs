//! Remote multipart store implementations.

pub mod aws;
pub mod backend;
pub mod memory;
