//! Deterministic system order for reports

use nixpkgs_review_nix::System;

/// Sort key of a system; reports list systems by descending key, so the
/// common platforms come first and the rest follow in reverse name order.
pub fn system_order_key(system: &str) -> (u8, &str) {
    let priority = match system {
        "x86_64-linux" => 4,
        "aarch64-linux" => 3,
        "x86_64-darwin" => 2,
        "aarch64-darwin" => 1,
        _ => 0,
    };
    (priority, system)
}

/// Order `systems` for display
pub fn order_systems<I, S>(systems: I) -> Vec<System>
where
    I: IntoIterator<Item = S>,
    S: Into<System>,
{
    let mut systems: Vec<System> = systems.into_iter().map(Into::into).collect();
    systems.sort_by(|a, b| system_order_key(b).cmp(&system_order_key(a)));
    systems
}
