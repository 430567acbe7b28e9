//! Integration tests for quiver-redis

use quiver_redis::*;

/// Moves the head of a list into a set, reporting the moved value.
fn move_native(ks: &mut Keyspace, keys: &[String], _args: &[String]) -> StoreResult<Reply> {
    match ks.rpop(&keys[0])? {
        Some(value) => {
            ks.sadd(&keys[1], &value)?;
            Ok(Reply::Bulk(value))
        }
        None => Ok(Reply::Nil),
    }
}

static MOVE: Script = Script {
    name: "test-move",
    lua: r#"
local v = redis.call('RPOP', KEYS[1])
if not v then return false end
redis.call('SADD', KEYS[2], v)
return v
"#,
    native: move_native,
    keys: Arity::Fixed(2),
    args: Arity::Fixed(0),
};

struct Move {
    from: String,
    to: String,
}

impl ScriptCall for Move {
    type Output = Option<String>;
    type Error = StoreError;

    fn script(&self) -> &'static Script {
        &MOVE
    }

    fn keys(&self) -> Vec<String> {
        vec![self.from.clone(), self.to.clone()]
    }

    fn args(&self) -> Vec<String> {
        Vec::new()
    }

    fn parse(&self, reply: Reply) -> Result<Self::Output, Self::Error> {
        reply.into_opt_string()
    }
}

/// A call that violates its script's layout.
struct Broken;

impl ScriptCall for Broken {
    type Output = ();
    type Error = StoreError;

    fn script(&self) -> &'static Script {
        &MOVE
    }

    fn keys(&self) -> Vec<String> {
        vec!["only-one".to_string()]
    }

    fn args(&self) -> Vec<String> {
        Vec::new()
    }

    fn parse(&self, _reply: Reply) -> Result<Self::Output, Self::Error> {
        Ok(())
    }
}

#[tokio::test]
async fn test_script_call_on_memory_store() {
    let store = MemoryStore::new();
    let scheme = KeyScheme::default();
    let from = scheme.key("ns", KeyType::Pending, "q", &[]);
    let to = scheme.key("ns", KeyType::Acknowledged, "q", &[]);
    store.with_keyspace(|ks| ks.lpush(&from, "m1")).unwrap();

    let call = Move {
        from: from.clone(),
        to: to.clone(),
    };
    assert_eq!(store.call(&call).await.unwrap().as_deref(), Some("m1"));
    assert_eq!(store.call(&call).await.unwrap(), None);
    assert!(store.sismember(&to, "m1").await.unwrap());
    assert_eq!(store.llen(&from).await.unwrap(), 0);
}

#[tokio::test]
async fn test_arity_violation_never_reaches_store() {
    let store = MemoryStore::new();
    let err = store.call(&Broken).await.unwrap_err();
    assert!(err.is_contract_violation());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_store_through_trait_object() {
    let store: std::sync::Arc<dyn Store> = std::sync::Arc::new(MemoryStore::new());
    assert!(store.set_nx_px("lock", "a", 10_000).await.unwrap());
    assert!(!store.set_nx_px("lock", "b", 10_000).await.unwrap());
    assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("a"));
    store.hset("h", "f", "v").await.unwrap();
    assert_eq!(store.hgetall("h").await.unwrap().len(), 1);
    assert_eq!(
        store.keys_with_prefix("lo").await.unwrap(),
        vec!["lock".to_string()]
    );
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_script_call_on_redis() {
    let url = std::env::var("QUIVER_REDIS_URL")
        .unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let store = RedisStore::connect(RedisConfig::new(url)).await.unwrap();
    let from = "quiver:test:from".to_string();
    let to = "quiver:test:to".to_string();
    store.del(&[from.clone(), to.clone()]).await.unwrap();

    let call = Move {
        from: from.clone(),
        to: to.clone(),
    };
    assert_eq!(store.call(&call).await.unwrap(), None);
    store.del(&[from, to]).await.unwrap();
}
