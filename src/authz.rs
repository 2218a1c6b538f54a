//! Authorization Collaborator
//!
//! A deliberate stub: every access check passes today, and
//! `PermissionDeniedError` stays reserved. The background refresher keeps
//! a process-local copy of the external policy document so a future
//! enforcement pass has fresh rules to read without a per-request fetch.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::error::SessionError;

const POLICY_CACHE_KEY: &str = "services_rbac";
const POLICY_PATH: &str = "/v1/policies/services_rbac";

pub struct PermissionService {
    policies: Arc<DashMap<String, String>>,
}

impl PermissionService {
    pub fn new() -> Self {
        Self {
            policies: Arc::new(DashMap::new()),
        }
    }

    /// Always grants. The signature is the enforcement seam; the cached
    /// policy document is where a real decision would come from.
    pub fn check_access(
        &self,
        _service_id: Option<&str>,
        _section: &str,
        _action: char,
    ) -> Result<(), SessionError> {
        Ok(())
    }

    pub fn cached_policy(&self) -> Option<String> {
        self.policies
            .get(POLICY_CACHE_KEY)
            .map(|entry| entry.value().clone())
    }

    /// Spawns the poller that refreshes the policy cache from
    /// `policy_agent_host` on `refresh_delay`. No host configured means no
    /// task.
    pub fn spawn_refresher(&self, policy_agent_host: Option<String>, refresh_delay: Duration) {
        let Some(host) = policy_agent_host else {
            tracing::info!("No policy agent configured, authorization cache stays empty");
            return;
        };

        let policies = self.policies.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let url = format!("{}{}", host.trim_end_matches('/'), POLICY_PATH);
            let mut interval = tokio::time::interval(refresh_delay);

            loop {
                interval.tick().await;

                match client.get(&url).send().await {
                    Ok(response) => match response.text().await {
                        Ok(body) => {
                            policies.insert(POLICY_CACHE_KEY.to_string(), body);
                            tracing::debug!("Refreshed policy cache from {}", url);
                        }
                        Err(e) => tracing::warn!("Policy body from {} unreadable: {}", url, e),
                    },
                    Err(e) => tracing::warn!("Policy refresh from {} failed: {}", url, e),
                }
            }
        });
    }
}

impl Default for PermissionService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_grants_everything() {
        let service = PermissionService::new();
        assert!(service.check_access(Some("svc"), "cart", 'u').is_ok());
        assert!(service.check_access(None, "cart", 'c').is_ok());
        assert!(service.cached_policy().is_none());
    }
}
