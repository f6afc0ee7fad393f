// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lua scripts executed by [`RedisStore`](crate::RedisStore).
//!
//! Every guarded script follows the same calling convention:
//!
//! - `ARGV[1]` is `1` when the call is guarded and `0` otherwise.
//! - When guarded, `KEYS[1]` is the region's version key and `ARGV[2]` the expected
//!   generation; data keys start at `KEYS[2]`. Otherwise data keys start at `KEYS[1]`.
//! - A stale generation makes the script return without touching any key. A missing
//!   version key counts as stale.

use std::sync::LazyLock;

use redis::{Script, ScriptInvocation};
use region_cache::VersionGuard;

const GUARD: &str = r"
local first = 1
if ARGV[1] == '1' then
    if redis.call('GET', KEYS[1]) ~= ARGV[2] then
        return STALE
    end
    first = 2
end
";

/// `ARGV[3]`: sliding TTL in milliseconds, 0 for none. `ARGV[4]`: `1` to report residual TTLs.
///
/// Returns `{status, values, ttls}`; status 0 means stale. Missing values are nil and TTLs
/// are `-1` when the key does not expire or was not asked for.
const FETCH_BODY: &str = r"
local sliding = tonumber(ARGV[3])
local with_ttl = ARGV[4] == '1'
local values = {}
local ttls = {}
for i = first, #KEYS do
    local value = redis.call('GET', KEYS[i])
    local ttl = -1
    if value then
        if sliding > 0 then
            redis.call('PEXPIRE', KEYS[i], sliding)
        end
        if with_ttl then
            ttl = redis.call('PTTL', KEYS[i])
        end
    end
    values[#values + 1] = value
    ttls[#ttls + 1] = ttl
end
return {1, values, ttls}
";

/// `ARGV[3]`: TTL in milliseconds, 0 for none. `ARGV[4]`: channel, empty for no
/// notification. `ARGV[5]`: notification payload. `ARGV[6..]`: one value per data key.
///
/// Returns 1, or 0 when stale.
const STORE_BODY: &str = r"
local ttl = tonumber(ARGV[3])
for i = first, #KEYS do
    local value = ARGV[6 + i - first]
    if ttl > 0 then
        redis.call('SET', KEYS[i], value, 'PX', ttl)
    else
        redis.call('SET', KEYS[i], value)
    end
end
if ARGV[4] ~= '' then
    redis.call('PUBLISH', ARGV[4], ARGV[5])
end
return 1
";

/// `ARGV[3]`: channel, empty for no notification. `ARGV[4]`: notification payload.
///
/// Returns how many keys existed, or -1 when stale.
const DELETE_BODY: &str = r"
local removed = 0
for i = first, #KEYS do
    removed = removed + redis.call('DEL', KEYS[i])
end
if ARGV[3] ~= '' then
    redis.call('PUBLISH', ARGV[3], ARGV[4])
end
return removed
";

/// `ARGV[3]`: lock token. `ARGV[4]`: TTL in milliseconds.
///
/// Returns 1 when every key was set, 0 when any key already existed, -1 when stale.
const LOCK_BODY: &str = r"
for i = first, #KEYS do
    if redis.call('EXISTS', KEYS[i]) == 1 then
        return 0
    end
end
for i = first, #KEYS do
    redis.call('SET', KEYS[i], ARGV[3], 'PX', ARGV[4])
end
return 1
";

/// `ARGV[3]`: lock token.
///
/// Returns how many keys held the token and were deleted, or -1 when stale.
const UNLOCK_BODY: &str = r"
local released = 0
for i = first, #KEYS do
    if redis.call('GET', KEYS[i]) == ARGV[3] then
        released = released + redis.call('DEL', KEYS[i])
    end
end
return released
";

/// `KEYS[1]`: version key. Initializes the generation to 1 when absent.
pub(crate) const READ_VERSION: &str = r"
redis.call('SET', KEYS[1], '1', 'NX')
return tonumber(redis.call('GET', KEYS[1]))
";

/// `KEYS[1]`: version key. `ARGV[1]`: highest allowed generation.
///
/// An absent version counts as generation 1. Generations above the maximum wrap to 1.
pub(crate) const BUMP_VERSION: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '1')
local next = current + 1
if next > tonumber(ARGV[1]) then
    next = 1
end
redis.call('SET', KEYS[1], next)
return next
";

fn guarded(stale: &str, body: &str) -> String {
    format!("{}{body}", GUARD.replace("STALE", stale))
}

pub(crate) static FETCH: LazyLock<Script> = LazyLock::new(|| Script::new(&guarded("{0, {}, {}}", FETCH_BODY)));
pub(crate) static STORE: LazyLock<Script> = LazyLock::new(|| Script::new(&guarded("0", STORE_BODY)));
pub(crate) static DELETE: LazyLock<Script> = LazyLock::new(|| Script::new(&guarded("-1", DELETE_BODY)));
pub(crate) static LOCK: LazyLock<Script> = LazyLock::new(|| Script::new(&guarded("-1", LOCK_BODY)));
pub(crate) static UNLOCK: LazyLock<Script> = LazyLock::new(|| Script::new(&guarded("-1", UNLOCK_BODY)));
pub(crate) static READ_VERSION_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(READ_VERSION));
pub(crate) static BUMP_VERSION_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(BUMP_VERSION));

/// Starts an invocation of a guarded script, filling in the guard arguments.
pub(crate) fn invoke<'a>(script: &'a Script, guard: Option<&VersionGuard>) -> ScriptInvocation<'a> {
    let mut invocation = script.prepare_invoke();
    match guard {
        Some(guard) => {
            invocation.key(&guard.key).arg("1").arg(guard.expected);
        }
        None => {
            invocation.arg("0").arg(0);
        }
    }
    invocation
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(FETCH_BODY)]
    #[case(STORE_BODY)]
    #[case(DELETE_BODY)]
    #[case(LOCK_BODY)]
    #[case(UNLOCK_BODY)]
    fn bodies_only_touch_data_keys(#[case] body: &str) {
        assert!(body.contains("for i = first, #KEYS do"));
        assert!(!body.contains("KEYS[1]"));
    }

    #[test]
    fn guard_returns_the_stale_marker_before_any_effect() {
        let script = guarded("-1", LOCK_BODY);

        let stale = script.find("return -1").expect("stale marker");
        let effect = script.find("redis.call('SET'").expect("effect");

        assert!(stale < effect);
        assert!(!script.contains("STALE"));
    }

    #[test]
    fn writes_publish_inside_the_script() {
        assert!(STORE_BODY.contains("redis.call('PUBLISH', ARGV[4], ARGV[5])"));
        assert!(DELETE_BODY.contains("redis.call('PUBLISH', ARGV[3], ARGV[4])"));
    }

    #[test]
    fn locks_check_every_key_before_setting_any() {
        let check = LOCK_BODY.find("EXISTS").expect("check");
        let set = LOCK_BODY.find("'SET'").expect("set");
        assert!(check < set);
    }

    #[test]
    fn unlock_compares_tokens() {
        assert!(UNLOCK_BODY.contains("redis.call('GET', KEYS[i]) == ARGV[3]"));
    }

    #[test]
    fn versions_wrap_to_one() {
        assert!(BUMP_VERSION.contains("or '1'"));
        assert!(BUMP_VERSION.contains("next = 1"));
        assert!(READ_VERSION.contains("'NX'"));
    }
}
