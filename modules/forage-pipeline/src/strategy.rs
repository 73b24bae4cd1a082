use std::cmp::Reverse;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use forage_common::{
    ForageError, Result, Strategy, StrategyKind, StrategyTiers, UsageOutcome,
};
use forage_store::{Collection, DocumentStore, Filter, Query};

/// Strategy bookkeeping for both discovery and dish-extraction techniques.
///
/// Strategy ids are UUIDs, unique across the two collections, so operations that
/// take only an id look in both.
#[derive(Clone)]
pub struct StrategyRegistry {
    discovery: Collection<Strategy>,
    extraction: Collection<Strategy>,
}

impl StrategyRegistry {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            discovery: Collection::new(store.clone(), StrategyKind::Discovery.collection()),
            extraction: Collection::new(store, StrategyKind::DishExtraction.collection()),
        }
    }

    fn collection(&self, kind: StrategyKind) -> &Collection<Strategy> {
        match kind {
            StrategyKind::Discovery => &self.discovery,
            StrategyKind::DishExtraction => &self.extraction,
        }
    }

    pub async fn seed(&self, strategy: Strategy) -> Result<Strategy> {
        if strategy.platform.trim().is_empty() || strategy.name.trim().is_empty() {
            return Err(ForageError::Validation(
                "strategy needs a platform and a name".into(),
            ));
        }
        let created = self.collection(strategy.kind).insert(None, &strategy).await?;
        info!(id = %created.id, platform = %created.platform, name = %created.name, "Seeded strategy");
        Ok(created)
    }

    pub async fn get(&self, id: &str) -> Result<Strategy> {
        let (_, strategy) = self.locate(id).await?;
        Ok(strategy)
    }

    async fn locate(&self, id: &str) -> Result<(&Collection<Strategy>, Strategy)> {
        for col in [&self.discovery, &self.extraction] {
            if let Some(s) = col.get(id).await? {
                return Ok((col, s));
            }
        }
        Err(ForageError::not_found("strategy", id))
    }

    /// Best active strategy for a platform: a chain-specific one if the chain has
    /// any, otherwise the best platform-wide default.
    pub async fn get_strategy(
        &self,
        kind: StrategyKind,
        platform: &str,
        chain_id: Option<&str>,
    ) -> Result<Option<Strategy>> {
        let candidates = self.list_active(kind, Some(platform)).await?;
        if let Some(chain) = chain_id {
            let specific = candidates
                .iter()
                .find(|s| s.chain_id.as_deref() == Some(chain));
            if let Some(s) = specific {
                return Ok(Some(s.clone()));
            }
        }
        Ok(candidates.into_iter().find(|s| s.chain_id.is_none()))
    }

    /// Active strategies, best first (success rate, then experience).
    pub async fn list_active(
        &self,
        kind: StrategyKind,
        platform: Option<&str>,
    ) -> Result<Vec<Strategy>> {
        let mut query = Query::new();
        if let Some(p) = platform {
            query = query.filter(Filter::eq("platform", p));
        }
        let mut active: Vec<Strategy> = self
            .collection(kind)
            .query(&query)
            .await?
            .into_iter()
            .filter(Strategy::is_active)
            .collect();
        active.sort_by_key(|s| (Reverse(s.success_rate), Reverse(s.total_uses)));
        Ok(active)
    }

    pub async fn record_usage(&self, id: &str, outcome: UsageOutcome) -> Result<Strategy> {
        let (col, _) = self.locate(id).await?;
        let now = Utc::now();
        let (strategy, ()) = col.mutate(id, |s| s.record(outcome, now)).await?;
        debug!(
            id,
            ?outcome,
            success_rate = strategy.success_rate,
            total_uses = strategy.total_uses,
            "Recorded strategy usage"
        );
        Ok(strategy)
    }

    pub async fn deprecate(&self, id: &str, reason: &str) -> Result<Strategy> {
        let (col, _) = self.locate(id).await?;
        let now = Utc::now();
        let (strategy, ()) = col.mutate(id, |s| s.deprecate(reason, now)).await?;
        info!(id, reason, "Deprecated strategy");
        Ok(strategy)
    }

    /// Create a child of `parent_id` with a new config. The child starts from the
    /// parent's success rate but has no usage of its own.
    pub async fn evolve(
        &self,
        parent_id: &str,
        config: Value,
        tags: Vec<String>,
    ) -> Result<Strategy> {
        let (col, parent) = self.locate(parent_id).await?;
        let child = col
            .insert(None, &Strategy::evolve_from(&parent, config, tags))
            .await?;
        info!(
            parent = parent_id,
            child = %child.id,
            prior = child.success_rate,
            "Evolved strategy"
        );
        Ok(child)
    }

    pub async fn get_strategy_tiers(
        &self,
        kind: StrategyKind,
        platform: Option<&str>,
    ) -> Result<StrategyTiers> {
        Ok(StrategyTiers::classify(self.list_active(kind, platform).await?))
    }

    /// Deprecate every active strategy with at least `min_uses` uses whose success
    /// rate is below `max_rate`. Returns the deprecated ids.
    pub async fn prune_underperformers(
        &self,
        kind: StrategyKind,
        min_uses: u64,
        max_rate: u8,
    ) -> Result<Vec<String>> {
        let mut pruned = Vec::new();
        for s in self.list_active(kind, None).await? {
            if s.total_uses < min_uses || s.success_rate >= max_rate {
                continue;
            }
            let reason = format!(
                "success rate {}% below {}% after {} uses",
                s.success_rate, max_rate, s.total_uses
            );
            match self.deprecate(&s.id, &reason).await {
                Ok(_) => pruned.push(s.id),
                // Deprecated concurrently.
                Err(ForageError::StrategyDeprecated { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use forage_store::MemoryStore;
    use serde_json::json;

    use super::*;

    fn registry() -> StrategyRegistry {
        StrategyRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn strategy(platform: &str, chain: Option<&str>, name: &str) -> Strategy {
        Strategy::seed(
            StrategyKind::Discovery,
            platform,
            chain.map(str::to_string),
            name,
            json!({}),
            vec![],
        )
    }

    async fn use_n(reg: &StrategyRegistry, id: &str, successes: u32, failures: u32) {
        for _ in 0..successes {
            reg.record_usage(id, UsageOutcome::Success).await.unwrap();
        }
        for _ in 0..failures {
            reg.record_usage(id, UsageOutcome::Failure).await.unwrap();
        }
    }

    #[tokio::test]
    async fn chain_specific_strategy_wins_over_platform_default() {
        let reg = registry();
        let generic = reg.seed(strategy("google_maps", None, "generic")).await.unwrap();
        let chain = reg
            .seed(strategy("google_maps", Some("c1"), "chain"))
            .await
            .unwrap();
        use_n(&reg, &generic.id, 9, 1).await;
        use_n(&reg, &chain.id, 1, 4).await;

        let picked = reg
            .get_strategy(StrategyKind::Discovery, "google_maps", Some("c1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(picked.id, chain.id);

        let picked = reg
            .get_strategy(StrategyKind::Discovery, "google_maps", Some("other"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(picked.id, generic.id);
    }

    #[tokio::test]
    async fn deprecated_strategies_are_never_selected() {
        let reg = registry();
        let best = reg.seed(strategy("yelp", None, "best")).await.unwrap();
        let fallback = reg.seed(strategy("yelp", None, "fallback")).await.unwrap();
        use_n(&reg, &best.id, 5, 0).await;
        use_n(&reg, &fallback.id, 1, 4).await;

        reg.deprecate(&best.id, "blocked by platform").await.unwrap();
        let picked = reg
            .get_strategy(StrategyKind::Discovery, "yelp", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(picked.id, fallback.id);

        let err = reg
            .record_usage(&best.id, UsageOutcome::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, ForageError::StrategyDeprecated { .. }));
        assert!(matches!(
            reg.deprecate(&best.id, "again").await,
            Err(ForageError::StrategyDeprecated { .. })
        ));
    }

    #[tokio::test]
    async fn no_strategy_for_unknown_platform() {
        let reg = registry();
        assert!(reg
            .get_strategy(StrategyKind::Discovery, "nowhere", None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn evolve_starts_from_parent_rate() {
        let reg = registry();
        let parent = reg.seed(strategy("yelp", Some("c9"), "base")).await.unwrap();
        use_n(&reg, &parent.id, 3, 1).await;

        let child = reg
            .evolve(&parent.id, json!({"q": "v2"}), vec!["v2".into()])
            .await
            .unwrap();
        assert_eq!(child.total_uses, 0);
        assert_eq!(child.success_rate, 75);
        assert_eq!(child.parent_strategy_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.chain_id.as_deref(), Some("c9"));
        assert_ne!(child.id, parent.id);
    }

    #[tokio::test]
    async fn concurrent_usage_is_serialized() {
        let reg = registry();
        let s = reg.seed(strategy("yelp", None, "hot")).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..100 {
            let reg = reg.clone();
            let id = s.id.clone();
            handles.push(tokio::spawn(async move {
                reg.record_usage(&id, UsageOutcome::Success).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let s = reg.get(&s.id).await.unwrap();
        assert_eq!(s.total_uses, 100);
        assert_eq!(s.successful_uses, 100);
        assert_eq!(s.success_rate, 100);
    }

    #[tokio::test]
    async fn prune_deprecates_proven_losers_only() {
        let reg = registry();
        let loser = reg.seed(strategy("yelp", None, "loser")).await.unwrap();
        let young = reg.seed(strategy("yelp", None, "young")).await.unwrap();
        let winner = reg.seed(strategy("yelp", None, "winner")).await.unwrap();
        use_n(&reg, &loser.id, 1, 9).await;
        use_n(&reg, &young.id, 0, 2).await;
        use_n(&reg, &winner.id, 8, 2).await;

        let pruned = reg
            .prune_underperformers(StrategyKind::Discovery, 5, 20)
            .await
            .unwrap();
        assert_eq!(pruned, vec![loser.id.clone()]);

        let tiers = reg
            .get_strategy_tiers(StrategyKind::Discovery, Some("yelp"))
            .await
            .unwrap();
        assert_eq!(tiers.high.len(), 1);
        assert_eq!(tiers.untested.len(), 1);
        assert!(tiers.low.is_empty());
    }
}
