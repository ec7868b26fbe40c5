//! Small helpers shared by both endpoint roles.

/// Pack a peer identity into a single 64-bit id.
///
/// Registries key on the full `(peer_type, peer_no)` tuple; this packing is
/// for logging and display only, so both 32-bit halves survive intact.
#[inline]
pub fn peer_id(peer_type: u32, peer_no: u32) -> u64 {
    (u64::from(peer_type) << 32) | u64::from(peer_no)
}

/// Compose the full function name used for proto binding and interceptor
/// callbacks: `mark.func`.
#[inline]
pub fn full_func_name(mark: &str, func_name: &str) -> String {
    format!("{}.{}", mark, func_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_keeps_both_halves() {
        assert_eq!(peer_id(0, 0), 0);
        assert_eq!(peer_id(1, 2), (1u64 << 32) | 2);
        assert_eq!(peer_id(u32::MAX, u32::MAX), u64::MAX);
        // Distinct tuples never collide, even with large peer numbers.
        assert_ne!(peer_id(1, 0x0001_0000), peer_id(2, 0));
    }

    #[test]
    fn test_full_func_name() {
        assert_eq!(full_func_name("game", "echo"), "game.echo");
        assert_eq!(full_func_name("", "echo"), ".echo");
    }
}
