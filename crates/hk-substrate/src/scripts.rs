//! Lua bodies for the atomic sections the Redis substrate evaluates
//! server-side. Loaded once per process; the client re-sends the source
//! transparently when a replica has not cached the hash yet.

/// Sliding-window probe.
///
/// KEYS[1]  window cell
/// ARGV[1]  now (ms)
/// ARGV[2]  window (ms)
/// ARGV[3]  cap (requests per window, burst already folded in)
/// ARGV[4]  ttl (seconds)
///
/// Returns `{allowed, remaining, reset_after_ms}`.
pub const SLIDING_WINDOW: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cap = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local current = redis.call('ZCARD', key)

if current < cap then
    redis.call('ZADD', key, now, now)
    redis.call('EXPIRE', key, ttl)
    return {1, cap - current - 1, window}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local reset_after = window
if #oldest > 0 then
    reset_after = math.max(window - (now - tonumber(oldest[2])), 0)
end
return {0, 0, reset_after}
"#;

/// Counter increment with TTL attached on creation only.
///
/// KEYS[1]  counter key
/// ARGV[1]  ttl (seconds)
///
/// Returns the post-increment value.
pub const COUNTER_INCR: &str = r#"
local value = redis.call('INCR', KEYS[1])
if value == 1 then
    redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
end
return value
"#;
