//! Darwin Core Archive support: the schema registry (C1) and the archive
//! layout builder (C2) used by the DwC-A package task variant.

pub mod archive;
pub mod registry;

pub use archive::ArchiveLayout;
pub use registry::Registry;
