//! In-process keyspace with Redis data-structure semantics.
//!
//! Empty containers are removed, type mismatches fail with
//! [`StoreError::WrongType`], and expirations are applied lazily on access.
//! Every write bumps a per-key version taken from a single monotonic
//! counter; watch sessions compare versions at commit time.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    String(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    SortedSet(SortedSet),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::String(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::SortedSet(z) => z.scores.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    order: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) -> bool {
        let fresh = match self.scores.insert(member.to_string(), score) {
            Some(old) => {
                self.order.remove(&(old, member.to_string()));
                false
            }
            None => true,
        };
        self.order.insert((score, member.to_string()));
        fresh
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.order.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// Mutable keyspace guarded by the [`MemoryStore`](super::MemoryStore) lock.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Entry>,
    versions: HashMap<String, u64>,
    clock: u64,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType(key.to_string())
}

/// Resolve Redis-style inclusive indexes (negative counts from the end).
fn index_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { len + start } else { start }.max(0);
    let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
    if start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

impl Keyspace {
    /// Create an empty keyspace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of a key. Keys that were never written report 0.
    pub fn version(&mut self, key: &str) -> u64 {
        self.expire_if_due(key);
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
    }

    fn expire_if_due(&mut self, key: &str) {
        let due = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= Instant::now()
        );
        if due {
            self.entries.remove(key);
            self.touch(key);
        }
    }

    fn value(&mut self, key: &str) -> Option<&Value> {
        self.expire_if_due(key);
        self.entries.get(key).map(|e| &e.value)
    }

    /// Mutable access to an existing value, bumping its version.
    fn existing_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.expire_if_due(key);
        if !self.entries.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.entries.get_mut(key).map(|e| &mut e.value)
    }

    /// Mutable access to a value, creating it with `init` if absent.
    fn upsert(
        &mut self,
        key: &str,
        fits: fn(&Value) -> bool,
        init: fn() -> Value,
    ) -> StoreResult<&mut Value> {
        self.expire_if_due(key);
        if let Some(entry) = self.entries.get(key)
            && !fits(&entry.value)
        {
            return Err(wrong_type(key));
        }
        self.touch(key);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: init(),
            expires_at: None,
        });
        Ok(&mut entry.value)
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|e| e.value.is_empty()) {
            self.entries.remove(key);
        }
    }

    // Keys

    /// `DEL` of one key.
    pub fn del(&mut self, key: &str) -> bool {
        self.expire_if_due(key);
        if self.entries.remove(key).is_some() {
            self.touch(key);
            true
        } else {
            false
        }
    }

    /// `EXISTS`.
    pub fn exists(&mut self, key: &str) -> bool {
        self.value(key).is_some()
    }

    /// `PEXPIRE`.
    pub fn pexpire(&mut self, key: &str, ttl_ms: u64) -> bool {
        self.expire_if_due(key);
        let at = Instant::now() + Duration::from_millis(ttl_ms);
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(at);
                self.touch(key);
                true
            }
            None => false,
        }
    }

    /// All live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&mut self, prefix: &str) -> Vec<String> {
        let candidates: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let mut keys: Vec<String> = candidates
            .into_iter()
            .filter(|k| self.exists(k))
            .collect();
        keys.sort();
        keys
    }

    // Strings

    /// `GET`.
    pub fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// `SET`, clearing any expiry.
    pub fn set(&mut self, key: &str, value: &str) {
        self.touch(key);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::String(value.to_string()),
                expires_at: None,
            },
        );
    }

    /// `SET key value PX ttl`.
    pub fn set_px(&mut self, key: &str, value: &str, ttl_ms: u64) {
        self.set(key, value);
        if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_millis(ttl_ms));
        }
    }

    /// `SET key value NX PX ttl`.
    pub fn set_nx_px(&mut self, key: &str, value: &str, ttl_ms: u64) -> bool {
        if self.exists(key) {
            return false;
        }
        self.set_px(key, value, ttl_ms);
        true
    }

    // Hashes

    fn hash(&mut self, key: &str) -> StoreResult<Option<&HashMap<String, String>>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_mut(&mut self, key: &str) -> StoreResult<&mut HashMap<String, String>> {
        match self.upsert(
            key,
            |v| matches!(v, Value::Hash(_)),
            || Value::Hash(HashMap::new()),
        )? {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    /// `HGET`.
    pub fn hget(&mut self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    /// `HEXISTS`.
    pub fn hexists(&mut self, key: &str, field: &str) -> StoreResult<bool> {
        Ok(self.hash(key)?.is_some_and(|h| h.contains_key(field)))
    }

    /// `HGETALL`.
    pub fn hgetall(&mut self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self.hash(key)?.cloned().unwrap_or_default())
    }

    /// `HLEN`.
    pub fn hlen(&mut self, key: &str) -> StoreResult<u64> {
        Ok(self.hash(key)?.map_or(0, |h| h.len() as u64))
    }

    /// `HSET` of one field.
    pub fn hset(&mut self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.hash_mut(key)?
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    /// `HSET` of several fields.
    pub fn hset_many<'a, I>(&mut self, key: &str, fields: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let hash = self.hash_mut(key)?;
        for (field, value) in fields {
            hash.insert(field.to_string(), value.to_string());
        }
        self.drop_if_empty(key);
        Ok(())
    }

    /// `HDEL`.
    pub fn hdel(&mut self, key: &str, field: &str) -> StoreResult<bool> {
        if self.hash(key)?.is_none_or(|h| !h.contains_key(field)) {
            return Ok(false);
        }
        let removed = match self.existing_mut(key) {
            Some(Value::Hash(h)) => h.remove(field).is_some(),
            _ => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// `HINCRBY`.
    pub fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let hash = self.hash_mut(key)?;
        let current = match hash.get(field) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| StoreError::Command(format!("hash value '{}' is not an integer", raw)))?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    // Lists

    fn list(&mut self, key: &str) -> StoreResult<Option<&VecDeque<String>>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::List(l)) => Ok(Some(l)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn list_mut(&mut self, key: &str) -> StoreResult<&mut VecDeque<String>> {
        match self.upsert(
            key,
            |v| matches!(v, Value::List(_)),
            || Value::List(VecDeque::new()),
        )? {
            Value::List(l) => Ok(l),
            _ => Err(wrong_type(key)),
        }
    }

    /// `LPUSH` of one value. Returns the new length.
    pub fn lpush(&mut self, key: &str, value: &str) -> StoreResult<u64> {
        let list = self.list_mut(key)?;
        list.push_front(value.to_string());
        Ok(list.len() as u64)
    }

    /// `RPUSH` of one value. Returns the new length.
    pub fn rpush(&mut self, key: &str, value: &str) -> StoreResult<u64> {
        let list = self.list_mut(key)?;
        list.push_back(value.to_string());
        Ok(list.len() as u64)
    }

    fn pop(&mut self, key: &str, front: bool) -> StoreResult<Option<String>> {
        if self.list(key)?.is_none() {
            return Ok(None);
        }
        let popped = match self.existing_mut(key) {
            Some(Value::List(l)) if front => l.pop_front(),
            Some(Value::List(l)) => l.pop_back(),
            _ => None,
        };
        self.drop_if_empty(key);
        Ok(popped)
    }

    /// `LPOP` (head, newest `LPUSH`).
    pub fn lpop(&mut self, key: &str) -> StoreResult<Option<String>> {
        self.pop(key, true)
    }

    /// `RPOP` (tail, oldest `LPUSH`).
    pub fn rpop(&mut self, key: &str) -> StoreResult<Option<String>> {
        self.pop(key, false)
    }

    /// `LREM key count value`.
    ///
    /// `count > 0` removes from the head, `count < 0` from the tail and
    /// `count == 0` removes every occurrence.
    pub fn lrem(&mut self, key: &str, count: i64, value: &str) -> StoreResult<u64> {
        let present = self.list(key)?.is_some_and(|l| l.iter().any(|v| v == value));
        if !present {
            return Ok(0);
        }
        let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
        let mut removed = 0usize;
        if let Some(Value::List(list)) = self.existing_mut(key) {
            let mut kept: Vec<String> = list.drain(..).collect();
            if count < 0 {
                kept.reverse();
            }
            kept.retain(|v| {
                if removed < limit && v == value {
                    removed += 1;
                    false
                } else {
                    true
                }
            });
            if count < 0 {
                kept.reverse();
            }
            list.extend(kept);
        }
        self.drop_if_empty(key);
        Ok(removed as u64)
    }

    /// `LRANGE`.
    pub fn lrange(&mut self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let Some(list) = self.list(key)? else {
            return Ok(Vec::new());
        };
        Ok(match index_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    /// `LLEN`.
    pub fn llen(&mut self, key: &str) -> StoreResult<u64> {
        Ok(self.list(key)?.map_or(0, |l| l.len() as u64))
    }

    // Sets

    fn set_value(&mut self, key: &str) -> StoreResult<Option<&BTreeSet<String>>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::Set(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// `SADD` of one member.
    pub fn sadd(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        match self.upsert(
            key,
            |v| matches!(v, Value::Set(_)),
            || Value::Set(BTreeSet::new()),
        )? {
            Value::Set(s) => Ok(s.insert(member.to_string())),
            _ => Err(wrong_type(key)),
        }
    }

    /// `SREM` of one member.
    pub fn srem(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        if !self.sismember(key, member)? {
            return Ok(false);
        }
        let removed = match self.existing_mut(key) {
            Some(Value::Set(s)) => s.remove(member),
            _ => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// `SMEMBERS`, sorted.
    pub fn smembers(&mut self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .set_value(key)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// `SISMEMBER`.
    pub fn sismember(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.set_value(key)?.is_some_and(|s| s.contains(member)))
    }

    /// `SCARD`.
    pub fn scard(&mut self, key: &str) -> StoreResult<u64> {
        Ok(self.set_value(key)?.map_or(0, |s| s.len() as u64))
    }

    // Sorted sets

    fn zset(&mut self, key: &str) -> StoreResult<Option<&SortedSet>> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::SortedSet(z)) => Ok(Some(z)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// `ZADD` of one member. Returns `true` if the member is new.
    pub fn zadd(&mut self, key: &str, score: i64, member: &str) -> StoreResult<bool> {
        match self.upsert(
            key,
            |v| matches!(v, Value::SortedSet(_)),
            || Value::SortedSet(SortedSet::default()),
        )? {
            Value::SortedSet(z) => Ok(z.insert(member, score)),
            _ => Err(wrong_type(key)),
        }
    }

    /// `ZREM` of one member.
    pub fn zrem(&mut self, key: &str, member: &str) -> StoreResult<bool> {
        if self.zscore(key, member)?.is_none() {
            return Ok(false);
        }
        let removed = match self.existing_mut(key) {
            Some(Value::SortedSet(z)) => z.remove(member),
            _ => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// `ZSCORE`.
    pub fn zscore(&mut self, key: &str, member: &str) -> StoreResult<Option<i64>> {
        Ok(self.zset(key)?.and_then(|z| z.scores.get(member).copied()))
    }

    /// `ZCARD`.
    pub fn zcard(&mut self, key: &str) -> StoreResult<u64> {
        Ok(self.zset(key)?.map_or(0, |z| z.scores.len() as u64))
    }

    /// `ZRANGE key start stop`, ascending by (score, member).
    pub fn zrange(&mut self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let Some(z) = self.zset(key)? else {
            return Ok(Vec::new());
        };
        Ok(match index_range(z.order.len(), start, stop) {
            Some((from, to)) => z
                .order
                .iter()
                .skip(from)
                .take(to - from + 1)
                .map(|(_, m)| m.clone())
                .collect(),
            None => Vec::new(),
        })
    }

    /// `ZRANGEBYSCORE key min max LIMIT offset count`, bounds inclusive.
    pub fn zrangebyscore(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
        offset: u64,
        count: u64,
    ) -> StoreResult<Vec<String>> {
        let Some(z) = self.zset(key)? else {
            return Ok(Vec::new());
        };
        Ok(z.order
            .iter()
            .filter(|(score, _)| *score >= min && *score <= max)
            .skip(offset as usize)
            .take(count as usize)
            .map(|(_, m)| m.clone())
            .collect())
    }

    /// `ZPOPMIN` of one member.
    pub fn zpopmin(&mut self, key: &str) -> StoreResult<Option<(String, i64)>> {
        let first = self
            .zset(key)?
            .and_then(|z| z.order.iter().next().cloned());
        match first {
            Some((score, member)) => {
                self.zrem(key, &member)?;
                Ok(Some((member, score)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ends() {
        let mut ks = Keyspace::new();
        ks.lpush("l", "a").unwrap();
        ks.lpush("l", "b").unwrap();
        ks.lpush("l", "c").unwrap();
        assert_eq!(ks.lrange("l", 0, -1).unwrap(), vec!["c", "b", "a"]);
        assert_eq!(ks.rpop("l").unwrap().as_deref(), Some("a"));
        assert_eq!(ks.lpop("l").unwrap().as_deref(), Some("c"));
        assert_eq!(ks.llen("l").unwrap(), 1);
        ks.rpop("l").unwrap();
        assert!(!ks.exists("l"));
    }

    #[test]
    fn test_lrem_directions() {
        let mut ks = Keyspace::new();
        for v in ["x", "y", "x", "x"] {
            ks.rpush("l", v).unwrap();
        }
        assert_eq!(ks.lrem("l", -1, "x").unwrap(), 1);
        assert_eq!(ks.lrange("l", 0, -1).unwrap(), vec!["x", "y", "x"]);
        assert_eq!(ks.lrem("l", 0, "x").unwrap(), 2);
        assert_eq!(ks.lrange("l", 0, -1).unwrap(), vec!["y"]);
    }

    #[test]
    fn test_wrong_type() {
        let mut ks = Keyspace::new();
        ks.set("k", "v");
        assert!(matches!(ks.lpush("k", "x"), Err(StoreError::WrongType(_))));
        assert!(matches!(ks.hget("k", "f"), Err(StoreError::WrongType(_))));
        // failed writes leave the value alone
        assert_eq!(ks.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_sorted_set_order_and_ranges() {
        let mut ks = Keyspace::new();
        ks.zadd("z", 5, "b").unwrap();
        ks.zadd("z", 1, "c").unwrap();
        ks.zadd("z", 5, "a").unwrap();
        assert_eq!(ks.zrange("z", 0, -1).unwrap(), vec!["c", "a", "b"]);
        assert_eq!(
            ks.zrangebyscore("z", 2, i64::MAX, 0, 10).unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(ks.zrangebyscore("z", i64::MIN, 5, 1, 1).unwrap(), vec!["a"]);
        // rescoring moves the member
        assert!(!ks.zadd("z", 0, "b").unwrap());
        assert_eq!(ks.zpopmin("z").unwrap(), Some(("b".to_string(), 0)));
        assert_eq!(ks.zcard("z").unwrap(), 2);
    }

    #[test]
    fn test_hash_ops() {
        let mut ks = Keyspace::new();
        assert_eq!(ks.hincrby("h", "n", 2).unwrap(), 2);
        assert_eq!(ks.hincrby("h", "n", -1).unwrap(), 1);
        ks.hset_many("h", [("a", "1"), ("b", "2")]).unwrap();
        assert_eq!(ks.hlen("h").unwrap(), 3);
        assert!(ks.hdel("h", "a").unwrap());
        assert!(!ks.hdel("h", "a").unwrap());
        assert!(ks.hexists("h", "b").unwrap());
    }

    #[test]
    fn test_versions_bump_on_write_and_delete() {
        let mut ks = Keyspace::new();
        assert_eq!(ks.version("k"), 0);
        ks.set("k", "1");
        let v1 = ks.version("k");
        assert!(v1 > 0);
        ks.get("k").unwrap();
        assert_eq!(ks.version("k"), v1);
        ks.del("k");
        assert!(ks.version("k") > v1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_expiry() {
        let mut ks = Keyspace::new();
        ks.set_px("lock", "token", 1_000);
        assert!(!ks.set_nx_px("lock", "other", 1_000));
        let before = ks.version("lock");
        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(!ks.exists("lock"));
        assert!(ks.version("lock") > before);
        assert!(ks.set_nx_px("lock", "other", 1_000));
    }
}
