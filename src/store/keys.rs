// ABOUTME: Helpers to build the store keys used for coordination.
// ABOUTME: Every key is namespaced under the configured prefix.

pub fn claims_pattern(prefix: &str) -> String {
    format!("{}:claim:*", prefix)
}

pub fn claim_key(prefix: &str, request_id: &str) -> String {
    format!("{}:claim:{}", prefix, request_id)
}

pub fn loads_pattern(prefix: &str) -> String {
    format!("{}:load:*", prefix)
}

pub fn load_key(prefix: &str, instance_id: &str) -> String {
    format!("{}:load:{}", prefix, instance_id)
}

pub fn health_key(prefix: &str, instance_id: &str) -> String {
    format!("{}:health:{}", prefix, instance_id)
}

/// Non-expiring hash of instance id to registry entry.
pub fn registry_key(prefix: &str) -> String {
    format!("{}:instances", prefix)
}
