/// Keyed-singleton registry
///
/// Maps a stable campaign key to the one owning worker set for that
/// campaign. Single-writer access is enforced here, by always handing out
/// the same instances, rather than by per-object locks.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use lazy_static::lazy_static;
use tokio::sync::Mutex;

use crate::config::SharedConfig;
use crate::gateway::{IdentityResolver, RewardLedger};
use crate::ingest::IngestScheduler;
use crate::provider::TweetProvider;
use crate::recovery::RecoveryEngine;
use crate::reward::RewardEngine;
use crate::store::StateStore;

pub struct WorkerDeps {
    pub config: SharedConfig,
    pub provider: Arc<dyn TweetProvider>,
    pub ledger: Arc<dyn RewardLedger>,
    pub identity: Arc<dyn IdentityResolver>,
    pub store: Arc<dyn StateStore>,
}

#[derive(Clone)]
pub struct CampaignWorkers {
    pub ingest: Arc<IngestScheduler>,
    pub rewards: Arc<RewardEngine>,
    pub recovery: Arc<RecoveryEngine>,
}

pub struct Registry {
    workers: Mutex<HashMap<String, CampaignWorkers>>,
}

lazy_static! {
    static ref GLOBAL: Registry = Registry {
        workers: Mutex::new(HashMap::new()),
    };
}

pub fn global() -> &'static Registry {
    &GLOBAL
}

impl Registry {
    /// Return the owning worker set for `campaign`, building and loading it
    /// from checkpoints on first use. The map stays locked for the whole
    /// get-or-create, so a key can never race into two owners.
    pub async fn obtain(&self, campaign: &str, deps: &WorkerDeps) -> Result<CampaignWorkers> {
        let mut workers = self.workers.lock().await;
        if let Some(existing) = workers.get(campaign) {
            return Ok(existing.clone());
        }

        log::info!("Building worker set for campaign {}", campaign);

        let ingest = IngestScheduler::load(
            campaign,
            deps.config.clone(),
            deps.provider.clone(),
            deps.store.clone(),
        )
        .await?;

        let rewards = RewardEngine::load(
            campaign,
            deps.config.clone(),
            deps.provider.clone(),
            deps.ledger.clone(),
            deps.identity.clone(),
            ingest.clone(),
            deps.store.clone(),
        )
        .await?;

        let recovery = RecoveryEngine::new(
            campaign,
            deps.config.clone(),
            ingest.clone(),
            rewards.clone(),
        );

        let set = CampaignWorkers {
            ingest,
            rewards,
            recovery,
        };
        workers.insert(campaign.to_string(), set.clone());
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, MemoryStateStore, MockLedger, MockProvider};

    #[tokio::test]
    async fn same_key_returns_the_same_owners() {
        let ledger = Arc::new(MockLedger::default());
        let deps = WorkerDeps {
            config: test_config().shared(),
            provider: Arc::new(MockProvider::default()),
            ledger: ledger.clone(),
            identity: ledger,
            store: Arc::new(MemoryStateStore::default()),
        };

        let registry = Registry {
            workers: Mutex::new(HashMap::new()),
        };

        let first = registry.obtain("campaign-a", &deps).await.unwrap();
        let second = registry.obtain("campaign-a", &deps).await.unwrap();
        assert!(Arc::ptr_eq(&first.ingest, &second.ingest));
        assert!(Arc::ptr_eq(&first.rewards, &second.rewards));

        let other = registry.obtain("campaign-b", &deps).await.unwrap();
        assert!(!Arc::ptr_eq(&first.ingest, &other.ingest));
    }
}
