/// Tenant scoping
///
/// Organizations are the isolation unit: queue partitions, concurrency caps and
/// credential lookups are all keyed by organization id. Workflows without an
/// organization run in the shared admin partition.

pub mod credentials;

pub use credentials::{CredentialStore, MemoryCredentialStore, SqliteCredentialStore};

/// Partition used for personal/admin-scope workflows
pub const ADMIN_PARTITION: &str = "admin";

/// Queue partition key for an optional organization id
pub fn partition_key(organization_id: Option<&str>) -> String {
    match organization_id {
        Some(org) if !org.is_empty() => org.to_string(),
        _ => ADMIN_PARTITION.to_string(),
    }
}

/// Organization id stored on jobs and runs for a partition key
pub fn organization_for_partition(partition: &str) -> Option<String> {
    (partition != ADMIN_PARTITION).then(|| partition.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_empty_org_maps_to_admin_partition() {
        assert_eq!(partition_key(None), "admin");
        assert_eq!(partition_key(Some("")), "admin");
        assert_eq!(partition_key(Some("org-7")), "org-7");
        assert_eq!(organization_for_partition("admin"), None);
        assert_eq!(organization_for_partition("org-7").as_deref(), Some("org-7"));
    }
}
