//! ocifs CLI - build ext4 root filesystems from OCI images.

pub mod commands;
pub mod output;
