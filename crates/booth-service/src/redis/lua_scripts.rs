//! Lua scripts for owner-checked writes.
//!
//! A lease key holds a random owner token. Only the current owner may
//! refresh or delete it; the compare and the write run atomically inside
//! Redis so an expired holder cannot touch a lease someone else now owns.
//! Lost-session buffering follows the same rule against `sessions:owner`.

/// Refresh a lease TTL if the caller still owns it.
///
/// Arguments:
/// - KEYS[1]: Lease key (e.g., `booth:advancing`)
/// - ARGV[1]: Owner token
/// - ARGV[2]: New TTL in milliseconds
///
/// Returns:
/// - 1: TTL refreshed
/// - 0: Not the owner (or lease gone)
pub const EXTEND_LEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Delete a lease if the caller still owns it.
///
/// Arguments:
/// - KEYS[1]: Lease key
/// - ARGV[1]: Owner token
///
/// Returns:
/// - 1: Released
/// - 0: Not the owner (or lease gone)
pub const RELEASE_LEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Append to a lost session's queue only while this instance owns it.
///
/// Arguments:
/// - KEYS[1]: Queue key (e.g., `sessions:queue:{user}`)
/// - KEYS[2]: Owner hash (`sessions:owner`)
/// - KEYS[3]: Lost marker key (`sessions:lost:{user}`)
/// - ARGV[1]: Owner instance ID
/// - ARGV[2]: User ID (field in the owner hash)
/// - ARGV[3]: Frame to append
/// - ARGV[4]: Number of newest frames to keep
/// - ARGV[5]: Queue TTL in milliseconds
///
/// Returns:
/// - 1: Appended
/// - 0: Owned elsewhere, or the marker is gone
pub const PUSH_IF_OWNER: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[2]) ~= ARGV[1] then
    return 0
end
if redis.call('EXISTS', KEYS[3]) == 0 then
    return 0
end
redis.call('RPUSH', KEYS[1], ARGV[3])
redis.call('LTRIM', KEYS[1], -tonumber(ARGV[4]), -1)
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return 1
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_compare_owner_before_writing() {
        for script in [EXTEND_LEASE, RELEASE_LEASE] {
            let compare = script.find("== ARGV[1]");
            let write = script
                .find("PEXPIRE")
                .or_else(|| script.find("'DEL'"));
            assert!(compare.is_some() && write.is_some());
            assert!(compare < write, "owner check must precede the write");
        }
    }

    #[test]
    fn test_buffer_push_checks_owner_and_marker_first() {
        let owner = PUSH_IF_OWNER.find("'HGET'");
        let marker = PUSH_IF_OWNER.find("'EXISTS'");
        let push = PUSH_IF_OWNER.find("'RPUSH'");
        assert!(owner.is_some() && marker.is_some() && push.is_some());
        assert!(owner < push && marker < push);
    }
}
