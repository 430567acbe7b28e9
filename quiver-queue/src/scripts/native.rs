//! Building blocks shared by the native script bodies.
//!
//! Each helper mirrors a fragment of the Lua sources so both backends move
//! messages and counters identically.

use quiver_redis::{Keyspace, StoreError, StoreResult};

/// Priority scores are `priority * 2^40 + seq`.
pub(crate) const PRIORITY_SHIFT: i64 = 1 << 40;

/// Counter fields of the properties hash.
pub(crate) const COUNTERS: [&str; 8] = [
    "pendingCount",
    "scheduledCount",
    "delayedCount",
    "requeuedCount",
    "processingCount",
    "acknowledgedCount",
    "deadLetteredCount",
    "messagesCount",
];

pub(crate) fn num(raw: &str) -> StoreResult<i64> {
    raw.parse()
        .map_err(|_| StoreError::contract(format!("expected number, got '{}'", raw)))
}

/// Numeric hash field; missing or empty reads as `None`.
pub(crate) fn field_num(ks: &mut Keyspace, key: &str, field: &str) -> StoreResult<Option<i64>> {
    match ks.hget(key, field)? {
        Some(raw) if !raw.is_empty() => num(&raw).map(Some),
        _ => Ok(None),
    }
}

pub(crate) fn incr(ks: &mut Keyspace, key: &str, field: &str, delta: i64) -> StoreResult<()> {
    ks.hincrby(key, field, delta)?;
    Ok(())
}

/// Write `field, value, field, value, ...` pairs.
pub(crate) fn set_pairs(ks: &mut Keyspace, key: &str, pairs: &[String]) -> StoreResult<()> {
    ks.hset_many(
        key,
        pairs
            .chunks_exact(2)
            .map(|pair| (pair[0].as_str(), pair[1].as_str())),
    )
}

/// Push onto the pending list, or score into the priority set.
pub(crate) fn enqueue(
    ks: &mut Keyspace,
    props: &str,
    list: &str,
    zset: &str,
    id: &str,
    priority: Option<i64>,
) -> StoreResult<()> {
    if ks.hget(props, "queueType")?.as_deref() == Some("PRIORITY") {
        let seq = ks.hincrby(props, "seq", 1)?;
        ks.zadd(zset, priority.unwrap_or(0) * PRIORITY_SHIFT + seq, id)?;
    } else {
        ks.lpush(list, id)?;
    }
    Ok(())
}

pub(crate) fn priority_arg(raw: &str) -> StoreResult<Option<i64>> {
    if raw.is_empty() {
        Ok(None)
    } else {
        num(raw).map(Some)
    }
}

/// Remove one message from an audit store and delete its record.
fn drop_audited(
    ks: &mut Keyspace,
    props: &str,
    audit: &str,
    counter: &str,
    index: &str,
    prefix: &str,
    id: &str,
) -> StoreResult<()> {
    ks.zrem(audit, id)?;
    ks.zrem(index, id)?;
    ks.del(&format!("{}{}", prefix, id));
    incr(ks, props, counter, -1)?;
    incr(ks, props, "messagesCount", -1)
}

/// Trim an audit store by age, then by size.
#[allow(clippy::too_many_arguments)]
pub(crate) fn evict(
    ks: &mut Keyspace,
    props: &str,
    audit: &str,
    counter: &str,
    index: &str,
    prefix: &str,
    now: i64,
    max_size: i64,
    expire_ms: i64,
) -> StoreResult<()> {
    if expire_ms > 0 {
        let expired = ks.zrangebyscore(audit, i64::MIN, now - expire_ms - 1, 0, u64::MAX)?;
        for id in expired {
            drop_audited(ks, props, audit, counter, index, prefix, &id)?;
        }
    }
    if max_size > 0 {
        let excess = ks.zcard(audit)? as i64 - max_size;
        if excess > 0 {
            for id in ks.zrange(audit, 0, excess - 1)? {
                drop_audited(ks, props, audit, counter, index, prefix, &id)?;
            }
        }
    }
    Ok(())
}
