//! Output verification ahead of classification

use nixpkgs_review_nix::{AttrsPerSystem, StoreVerifier};
use tracing::debug;

/// Verify the output path of every record that could count as built.
///
/// Broken and blacklisted records and records without an output path are
/// left unverified. Records that were verified before are not checked again.
pub async fn verify_outputs(attrs_per_system: &mut AttrsPerSystem, verifier: &dyn StoreVerifier) {
    for (system, attrs) in attrs_per_system.iter_mut() {
        let mut verified = 0usize;
        let mut checked = 0usize;
        for attr in attrs.iter_mut() {
            if attr.broken || attr.blacklisted || attr.path.is_none() {
                continue;
            }
            checked += 1;
            if attr.verify(verifier).await {
                verified += 1;
            }
        }
        debug!(system = %system, checked, verified, "Verified output paths");
    }
}
