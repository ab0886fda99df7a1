//! Globally unique identifiers for tasks and service instances.

use std::process;
use std::sync::OnceLock;
use uuid::Uuid;

/// Fresh uid for a receiver instance.
pub fn new_service_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Task ids embed the queue name, a host fragment, the pid and a uuid, so
/// they are unique across every caller sharing the broker. The task id also
/// names the reply list for the exchange.
pub fn new_task_id(queue_name: &str) -> String {
    format!(
        "{}{}-{}-{}",
        queue_name,
        host_fragment(),
        process::id(),
        Uuid::new_v4().simple()
    )
}

/// Key under which the request payload for `task_id` is stored.
pub fn request_key(task_id: &str) -> String {
    format!("request_{task_id}")
}

fn host_fragment() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| {
        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| format!("h{}", Uuid::new_v4().simple()))
    })
    .as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn task_ids_start_with_the_queue_name() {
        let id = new_task_id("jobs_main");
        assert!(id.starts_with("jobs_main"));
    }

    #[test]
    fn task_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| new_task_id("q")).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn request_keys_are_prefixed() {
        assert_eq!(request_key("abc"), "request_abc");
    }
}
