use crate::store::Store;
use crate::types::Tenant;

/// Resolves an inbound request to the tenant that owns it. Every resolution
/// is a fresh read of tenant storage, so configuration edits take effect on
/// the next request with no cache to invalidate.
pub struct TenantDirectory {
    /// When no tenant matches, answer with the first active tenant rather
    /// than rejecting. Acceptable for a small fixed tenant set; disableable
    /// because it is a data-isolation risk between untrusting tenants.
    pub fallback_to_first_active: bool,
}

impl TenantDirectory {
    pub fn new(fallback_to_first_active: bool) -> Self {
        Self {
            fallback_to_first_active,
        }
    }

    /// Match by case-sensitive substring of the Origin header, not by URL
    /// parsing. A store failure resolves to `None` and the caller degrades to
    /// the generic prompt.
    pub async fn resolve_by_origin(&self, store: &Store, origin: &str) -> Option<Tenant> {
        let tenants = match store.list_active_tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                eprintln!("[directory] tenant lookup failed: {err}");
                return None;
            }
        };
        let matched = tenants
            .iter()
            .find(|t| !t.domain.is_empty() && origin.contains(&t.domain))
            .cloned();
        matched.or_else(|| self.fallback(tenants))
    }

    pub async fn resolve_by_platform_recipient(
        &self,
        store: &Store,
        recipient_id: &str,
    ) -> Option<Tenant> {
        let tenants = match store.list_active_tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                eprintln!("[directory] tenant lookup failed: {err}");
                return None;
            }
        };
        let matched = tenants
            .iter()
            .find(|t| t.platform_recipient_ids.iter().any(|id| id == recipient_id))
            .cloned();
        matched.or_else(|| self.fallback(tenants))
    }

    /// Explicit clientId override from the chat API. Takes precedence over
    /// origin inference; the fallback policy still applies when the id is
    /// unknown.
    pub async fn resolve_by_client_id(&self, store: &Store, client_id: &str) -> Option<Tenant> {
        let tenants = match store.list_active_tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                eprintln!("[directory] tenant lookup failed: {err}");
                return None;
            }
        };
        let matched = tenants.iter().find(|t| t.id == client_id).cloned();
        matched.or_else(|| self.fallback(tenants))
    }

    fn fallback(&self, tenants: Vec<Tenant>) -> Option<Tenant> {
        if !self.fallback_to_first_active {
            return None;
        }
        tenants.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatbotConfig;

    fn tenant(id: &str, domain: &str, recipients: &[&str]) -> Tenant {
        Tenant {
            id: id.to_string(),
            status: "active".to_string(),
            domain: domain.to_string(),
            platform_recipient_ids: recipients.iter().map(|r| r.to_string()).collect(),
            config: ChatbotConfig::default(),
        }
    }

    fn seeded_store() -> Store {
        Store::memory_with_tenants(vec![
            tenant("acme", "acme.example", &["page-acme"]),
            tenant("globex", "globex.example", &["page-globex"]),
        ])
    }

    #[tokio::test]
    async fn origin_matches_by_substring() {
        let directory = TenantDirectory::new(true);
        let store = seeded_store();
        let resolved = directory
            .resolve_by_origin(&store, "https://www.globex.example")
            .await
            .unwrap();
        assert_eq!(resolved.id, "globex");
    }

    #[tokio::test]
    async fn unmatched_origin_falls_back_to_first_active() {
        let directory = TenantDirectory::new(true);
        let store = seeded_store();
        let resolved = directory
            .resolve_by_origin(&store, "https://stranger.example")
            .await
            .unwrap();
        assert_eq!(resolved.id, "acme");
    }

    #[tokio::test]
    async fn fallback_can_be_disabled() {
        let directory = TenantDirectory::new(false);
        let store = seeded_store();
        assert!(directory
            .resolve_by_origin(&store, "https://stranger.example")
            .await
            .is_none());
        assert!(directory
            .resolve_by_platform_recipient(&store, "page-unknown")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn recipient_id_resolves_owning_tenant() {
        let directory = TenantDirectory::new(true);
        let store = seeded_store();
        let resolved = directory
            .resolve_by_platform_recipient(&store, "page-globex")
            .await
            .unwrap();
        assert_eq!(resolved.id, "globex");
    }
}
