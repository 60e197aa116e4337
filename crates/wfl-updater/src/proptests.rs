//! Property-based tests for wfl-updater.
//!
//! These tests use proptest to verify correctness properties across
//! randomly generated inputs.
//!
//! # Properties Tested
//!
//! - Digest determinism and agreement between file and buffer hashing
//! - Detached manifest signatures: accepted with the signing key only
//! - Manifest rejection for bad digests, sizes and base URLs
//! - Path confinement of manifest entries
//! - Version comparison with zero padding
//! - Rollback restores every backed up file byte for byte

#![cfg(test)]

use proptest::prelude::*;
use tempfile::TempDir;

use ed25519_dalek::SigningKey;

use crate::manifest::{validate_relative_path, FileEntry, Manifest, ManifestVersion};
use crate::rollback::BackupSet;
use crate::security::{
    digest_bytes, file_digest_blocking, sign_payload, verify_signature, SecurityService,
};

// =============================================================================
// Generators
// =============================================================================

/// Generate a random Ed25519 signing key from 32 random bytes.
fn arb_signing_key() -> impl Strategy<Value = SigningKey> {
    prop::array::uniform32(any::<u8>()).prop_map(|bytes| SigningKey::from_bytes(&bytes))
}

/// Generate random file content (1 byte to 10KB).
fn arb_content() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..10240)
}

/// Generate a safe path segment.
fn arb_segment() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-][a-zA-Z0-9_.-]{0,11}".prop_filter("relative segment", |s| s != "." && s != "..")
}

/// Generate a safe relative path of 1 to 4 segments.
fn arb_relative_path() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_segment(), 1..4).prop_map(|segments| segments.join("/"))
}

/// Generate version components (2 to 4 of them).
fn arb_version_parts() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..1000, 2..=4)
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Manifest with one entry for `content`.
fn manifest_for(content: &[u8]) -> Manifest {
    Manifest {
        version: "1.0.0".to_string(),
        channel: "stable".to_string(),
        base_url: "https://cdn.example.com/game".to_string(),
        files: vec![FileEntry {
            path: "data/file.bin".to_string(),
            size: content.len() as u64,
            sha256: digest_bytes(content),
            url: None,
            compressed: false,
            optional: false,
            executable: false,
            delta: None,
        }],
        executable_name: "game".to_string(),
        launch_arguments: None,
        force_update: false,
    }
}

fn join_version(parts: &[u64]) -> String {
    parts
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

// =============================================================================
// Digest determinism
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Hashing the same unmodified file twice yields the same digest, and
    /// streaming from disk agrees with hashing the buffer.
    #[test]
    fn prop_digest_deterministic(content in arb_content()) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, &content).unwrap();

        let first = file_digest_blocking(&path).unwrap();
        let second = file_digest_blocking(&path).unwrap();

        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&first, &digest_bytes(&content));
        prop_assert_eq!(first.len(), 64);
    }

    /// Any single-byte change alters the digest.
    #[test]
    fn prop_digest_detects_modification(
        content in arb_content(),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut modified = content.clone();
        let i = index.index(modified.len());
        modified[i] ^= flip;

        prop_assert_ne!(digest_bytes(&content), digest_bytes(&modified));
    }
}

// =============================================================================
// Manifest signatures
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// A manifest signed with a key verifies against that key.
    #[test]
    fn prop_valid_signature_accepted(signing_key in arb_signing_key(), payload in arb_content()) {
        let signature = sign_payload(&signing_key, &payload);
        let service = SecurityService::new(Some(signing_key.verifying_key()));

        prop_assert!(service.verify_manifest_signature(&payload, &signature));
    }

    /// A manifest signed with one key is rejected under another.
    #[test]
    fn prop_foreign_signature_rejected(
        signing_key1 in arb_signing_key(),
        signing_key2 in arb_signing_key(),
        payload in arb_content(),
    ) {
        prop_assume!(signing_key1.to_bytes() != signing_key2.to_bytes());

        let signature = sign_payload(&signing_key1, &payload);
        prop_assert!(!verify_signature(&payload, &signature, &signing_key2.verifying_key()));
    }

    /// Tampering with the signed bytes invalidates the signature.
    #[test]
    fn prop_tampered_payload_rejected(
        signing_key in arb_signing_key(),
        payload in arb_content(),
        index in any::<prop::sample::Index>(),
    ) {
        let signature = sign_payload(&signing_key, &payload);
        let mut tampered = payload.clone();
        let i = index.index(tampered.len());
        tampered[i] = tampered[i].wrapping_add(1);

        prop_assert!(!verify_signature(&tampered, &signature, &signing_key.verifying_key()));
    }
}

// =============================================================================
// Manifest validation
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// A digest of any length other than 64 fails validation.
    #[test]
    fn prop_bad_digest_length_rejected(content in arb_content(), len in 0usize..128) {
        prop_assume!(len != 64);
        let mut manifest = manifest_for(&content);
        manifest.files[0].sha256 = "a".repeat(len);

        prop_assert!(!manifest.is_valid());
    }

    /// A zero size fails validation regardless of the rest of the entry.
    #[test]
    fn prop_zero_size_rejected(content in arb_content()) {
        let mut manifest = manifest_for(&content);
        manifest.files[0].size = 0;

        prop_assert!(!manifest.is_valid());
    }

    /// A blank base URL fails validation.
    #[test]
    fn prop_missing_base_url_rejected(content in arb_content(), blanks in "[ \t]{0,4}") {
        let mut manifest = manifest_for(&content);
        manifest.base_url = blanks;

        prop_assert!(!manifest.is_valid());
    }

    /// Well-formed manifests with safe paths pass.
    #[test]
    fn prop_well_formed_manifest_accepted(content in arb_content(), path in arb_relative_path()) {
        prop_assume!(!path.starts_with(".wfl-") && path != "manifest.json");
        let mut manifest = manifest_for(&content);
        manifest.files[0].path = path;

        prop_assert!(manifest.is_valid());
    }
}

// =============================================================================
// Path confinement
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Generated safe paths are accepted.
    #[test]
    fn prop_safe_paths_accepted(path in arb_relative_path()) {
        prop_assert!(validate_relative_path(&path).is_ok());
    }

    /// Inserting a parent segment anywhere is rejected.
    #[test]
    fn prop_parent_segment_rejected(
        segments in prop::collection::vec(arb_segment(), 0..4),
        index in any::<prop::sample::Index>(),
    ) {
        let mut segments = segments;
        let at = index.index(segments.len() + 1);
        segments.insert(at, "..".to_string());
        let path = segments.join("/");

        prop_assert!(validate_relative_path(&path).is_err());
    }

    /// Absolute and backslash paths are rejected.
    #[test]
    fn prop_absolute_paths_rejected(path in arb_relative_path()) {
        let absolute = format!("/{path}");
        let windows = path.replace('/', "\\");
        prop_assert!(validate_relative_path(&absolute).is_err());
        if windows.contains('\\') {
            prop_assert!(validate_relative_path(&windows).is_err());
        }
    }
}

// =============================================================================
// Version comparison
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Parsing a rendered version gives back the same components.
    #[test]
    fn prop_version_parse(parts in arb_version_parts()) {
        let version: ManifestVersion = join_version(&parts).parse().unwrap();
        prop_assert_eq!(version.parts(), parts.as_slice());
    }

    /// Trailing zero components do not change equality.
    #[test]
    fn prop_version_zero_padding(parts in prop::collection::vec(0u64..1000, 2..=3)) {
        let short: ManifestVersion = join_version(&parts).parse().unwrap();
        let mut padded_parts = parts.clone();
        padded_parts.push(0);
        let padded: ManifestVersion = join_version(&padded_parts).parse().unwrap();

        prop_assert_eq!(short, padded);
    }

    /// Ordering agrees with lexicographic comparison of equal-length parts.
    #[test]
    fn prop_version_ordering(a in prop::collection::vec(0u64..50, 3), b in prop::collection::vec(0u64..50, 3)) {
        let va: ManifestVersion = join_version(&a).parse().unwrap();
        let vb: ManifestVersion = join_version(&b).parse().unwrap();
        prop_assert_eq!(va.cmp(&vb), a.cmp(&b));
    }
}

// =============================================================================
// Rollback completeness
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    /// Every backed up file has its pre-update digest after rollback,
    /// whatever the apply did to it in between.
    #[test]
    fn prop_rollback_restores_digests(
        originals in prop::collection::vec(arb_content(), 1..5),
        replacement in arb_content(),
        delete_mask in any::<u8>(),
    ) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let paths: Vec<String> = (0..originals.len()).map(|i| format!("data/f{i}.bin")).collect();

        std::fs::create_dir_all(root.join("data")).unwrap();
        for (path, content) in paths.iter().zip(&originals) {
            std::fs::write(root.join(path), content).unwrap();
        }

        let mut backup = BackupSet::begin(root, "2.0", Some("1.0")).unwrap();
        for path in &paths {
            prop_assert!(backup.backup_file(path).unwrap());
        }

        for (i, path) in paths.iter().enumerate() {
            if delete_mask & (1 << i) != 0 {
                std::fs::remove_file(root.join(path)).unwrap();
            } else {
                std::fs::write(root.join(path), &replacement).unwrap();
            }
        }

        backup.restore_all().unwrap();
        for (path, content) in paths.iter().zip(&originals) {
            let restored = file_digest_blocking(&root.join(path)).unwrap();
            prop_assert_eq!(restored, digest_bytes(content));
        }
    }
}
