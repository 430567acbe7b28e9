//! Atomic broker operations.
//!
//! Every message transition and its counter updates run as one script
//! against the store. Each script has a Lua body for Redis and a native
//! body for [`MemoryStore`](quiver_redis::MemoryStore); call sites build
//! invocations through the typed [`ScriptCall`](quiver_redis::ScriptCall)
//! structs in this module, never by hand.
//!
//! Replies are status tokens (`OK` or an error token such as
//! `QUEUE_NOT_FOUND`), counts, or arrays. Anything else is a contract
//! violation.

mod admin;
mod lifecycle;
mod manage;
mod native;
mod promote;
mod publish;

use quiver_redis::{Reply, Script};

use crate::error::{QueueError, QueueResult};

pub use admin::{CREATE_CONSUMER_GROUP, CREATE_QUEUE, DELETE_CONSUMER_GROUP, DELETE_QUEUE};
pub use lifecycle::{ACKNOWLEDGE, FETCH_FOR_PROCESSING, HANDLE_UNACKNOWLEDGMENT};
pub use manage::{DELETE_MESSAGE, REQUEUE_MESSAGE};
pub use promote::{PROMOTE_DELAYED, PROMOTE_REQUEUED, PROMOTE_SCHEDULED};
pub use publish::PUBLISH;

pub(crate) use admin::{CreateConsumerGroup, CreateQueue, DeleteConsumerGroup, DeleteQueue};
pub(crate) use lifecycle::{Acknowledge, FetchForProcessing, HandleUnacknowledgment, UnackTarget};
pub(crate) use manage::{DeleteMessages, DeleteOutcome, DeleteTarget, RequeueMessage};
pub(crate) use promote::{PromoteDelayed, PromoteRequeued, PromoteScheduled, ScheduleMode};
pub(crate) use publish::Publish;

/// Every broker script.
pub fn all() -> [&'static Script; 13] {
    [
        &CREATE_QUEUE,
        &DELETE_QUEUE,
        &CREATE_CONSUMER_GROUP,
        &DELETE_CONSUMER_GROUP,
        &PUBLISH,
        &FETCH_FOR_PROCESSING,
        &ACKNOWLEDGE,
        &HANDLE_UNACKNOWLEDGMENT,
        &PROMOTE_DELAYED,
        &PROMOTE_REQUEUED,
        &PROMOTE_SCHEDULED,
        &REQUEUE_MESSAGE,
        &DELETE_MESSAGE,
    ]
}

/// Accept `OK`; map any other token to its error.
pub(crate) fn expect_ok(reply: Reply, subject: &str) -> QueueResult<()> {
    match reply.token() {
        Some("OK") => Ok(()),
        Some(token) => Err(QueueError::from_token(token, subject)),
        None => Err(QueueError::ContractViolation(format!(
            "expected status token, got {:?}",
            reply
        ))),
    }
}

/// A reply that is either a count or an error token.
pub(crate) fn expect_count(reply: Reply, subject: &str) -> QueueResult<u64> {
    match reply {
        Reply::Int(n) if n >= 0 => Ok(n as u64),
        Reply::Status(token) | Reply::Bulk(token) => Err(QueueError::from_token(&token, subject)),
        other => Err(QueueError::ContractViolation(format!(
            "expected count, got {:?}",
            other
        ))),
    }
}

fn bool_arg(flag: bool) -> String {
    if flag { "1" } else { "0" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_script_names_are_unique() {
        let names: HashSet<_> = all().iter().map(|s| s.name).collect();
        assert_eq!(names.len(), all().len());
    }

    #[test]
    fn test_lua_sources_document_layout() {
        for script in all() {
            assert!(script.lua.contains("-- KEYS:"), "{}", script.name);
            assert!(script.lua.contains("-- ARGV:"), "{}", script.name);
        }
    }

    #[test]
    fn test_expect_ok() {
        assert!(expect_ok(Reply::Bulk("OK".into()), "q").is_ok());
        assert!(matches!(
            expect_ok(Reply::Bulk("QUEUE_STOPPED".into()), "q"),
            Err(QueueError::QueueStopped(_))
        ));
        assert!(expect_ok(Reply::Int(1), "q").unwrap_err().is_fatal());
    }

    #[test]
    fn test_expect_count() {
        assert_eq!(expect_count(Reply::Int(3), "q").unwrap(), 3);
        assert!(expect_count(Reply::Array(vec![]), "q").unwrap_err().is_fatal());
    }
}
