use kestrel_core::{AppError, AppResult, InstanceName};

/// Namespace used when none is configured.
pub const DEFAULT_KEY_NAMESPACE: &str = "kestrel";

/// Deterministic key layout shared by every instance of one fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    /// Creates a namespace from a non-empty prefix.
    pub fn new(prefix: impl Into<String>) -> AppResult<Self> {
        let prefix = prefix.into();
        let prefix = prefix.trim().trim_end_matches('/');
        if prefix.is_empty() {
            return Err(AppError::Validation(
                "coordination key namespace must not be empty".to_owned(),
            ));
        }

        Ok(Self {
            prefix: prefix.to_owned(),
        })
    }

    /// Returns the namespace prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        self.prefix.as_str()
    }

    /// Cluster-wide lock guarding the instance list and dead-instance scans.
    #[must_use]
    pub fn meta_lock_key(&self) -> String {
        format!("{}/meta", self.prefix)
    }

    /// JSON array of every known instance name.
    #[must_use]
    pub fn instance_list_key(&self) -> String {
        format!("{}/instance-name-list", self.prefix)
    }

    /// Liveness lease of one instance.
    #[must_use]
    pub fn instance_lease_key(&self, instance_name: &InstanceName) -> String {
        format!("{}/instances/{instance_name}", self.prefix)
    }

    /// Hash of in-flight requests owned by one instance for one request domain.
    #[must_use]
    pub fn request_hash_key(&self, domain: &str, instance_name: &InstanceName) -> String {
        format!("{}/{domain}/{instance_name}/requests", self.prefix)
    }

    /// Lease key of one named master/backup election.
    #[must_use]
    pub fn election_key(&self, job_name: &str) -> String {
        format!("{}/{job_name}", self.prefix)
    }
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_KEY_NAMESPACE.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use kestrel_core::InstanceName;

    use super::KeyNamespace;

    #[test]
    fn keys_follow_namespace_layout() {
        let namespace = KeyNamespace::new("fleet/").unwrap_or_else(|_| unreachable!());
        let instance = InstanceName::new("abcd1234").unwrap_or_else(|_| unreachable!());

        assert_eq!(namespace.meta_lock_key(), "fleet/meta");
        assert_eq!(namespace.instance_list_key(), "fleet/instance-name-list");
        assert_eq!(
            namespace.instance_lease_key(&instance),
            "fleet/instances/abcd1234"
        );
        assert_eq!(
            namespace.request_hash_key("buildjob", &instance),
            "fleet/buildjob/abcd1234/requests"
        );
    }

    #[test]
    fn blank_namespace_is_rejected() {
        assert!(KeyNamespace::new(" / ").is_err());
    }
}
