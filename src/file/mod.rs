//! File tree and content lifecycle for Hoard.
//!
//! This module maps a per-owner hierarchical namespace onto storage backends:
//! - File nodes (folders and files) with soft delete and restore
//! - Hash-based content dedup with reference-counted reclamation
//! - Atomic per-owner quota accounting
//! - Content versions with point-in-time restore
//! - Streaming ZIP export and the recycle bin sweep

mod export;
mod hash;
mod indexer;
mod ledger;
mod node;
mod quota;
mod service;
mod sweeper;
mod version;
mod versioning;

pub use export::{ExportManifest, SkippedEntry};
pub use hash::{sha256_hex, HashOutcome, HashingReader};
pub use indexer::{ContentIndexer, NoopIndexer};
pub use ledger::ContentLedger;
pub use node::{FileNode, FileNodeRepository, NewFileNode};
pub use quota::QuotaLedger;
pub use service::{FileService, OpenedFile, UploadRequest};
pub use sweeper::RecycleSweeper;
pub use version::{FileVersion, FileVersionRepository, NewFileVersion};

use crate::{HoardError, Result};

/// Parent id of nodes at the top of an owner's namespace.
pub const ROOT_ID: i64 = 0;

/// Maximum length for a node name (in characters).
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum number of ancestors walked when checking a move for cycles.
pub const MAX_TREE_DEPTH: usize = 256;

/// Validate a display name for a file or folder.
///
/// Returns the trimmed name.
pub fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(HoardError::Validation("name is empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(HoardError::Validation(format!(
            "name must be at most {MAX_NAME_LENGTH} characters"
        )));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(HoardError::Validation(format!(
            "name contains an invalid character: {name}"
        )));
    }
    if name == "." || name == ".." {
        return Err(HoardError::Validation(format!("name is reserved: {name}")));
    }
    Ok(name.to_string())
}

/// Extension of `name` including the leading dot, or an empty string.
///
/// Dot files such as `.bashrc` have no extension.
pub fn extension_of(name: &str) -> String {
    match name.rfind('.') {
        Some(0) | None => String::new(),
        Some(i) if i + 1 == name.len() => String::new(),
        Some(i) => name[i..].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("report.pdf").unwrap(), "report.pdf");
        assert_eq!(validate_name("  notes  ").unwrap(), "notes");
        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LENGTH)).is_ok());
        assert!(validate_name(&"x".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_name_counts_characters() {
        let name = "ファ".repeat(MAX_NAME_LENGTH / 2);
        assert!(validate_name(&name).is_ok());
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("a.txt"), ".txt");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("README"), "");
        assert_eq!(extension_of(".bashrc"), "");
        assert_eq!(extension_of("trailing."), "");
    }
}
