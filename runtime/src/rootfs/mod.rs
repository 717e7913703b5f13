//! Rootfs construction.
//!
//! A [`RootfsBuild`] stages an image's layers into a scratch directory,
//! applies local file overlays, and hands the tree to an
//! [`ImageFormatter`] that writes the final filesystem image.

mod build;
mod format;
mod staging;

pub use build::{BuildState, RootfsBuild};
pub use format::{Ext4Formatter, ImageFormatter};
pub use staging::{StagingDir, StagingLease};
