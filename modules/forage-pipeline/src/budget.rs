use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use forage_common::config::{BudgetConfig, PricingConfig};
use forage_common::{
    day_id, month_key, Admission, BudgetRecord, BudgetStatus, CostCategory, ForageError,
    MonthlyTotals, Result, ThrottleEvent, ThrottleState,
};
use forage_store::{Collection, DocumentStore, Filter, Query};

pub const BUDGET_COLLECTION: &str = "budget_days";

/// Persistent per-day spend ledger and the throttle controller that reads it.
///
/// Every write is a serialized update of the current day's document, so
/// concurrent workers never lose increments. The throttle is soft: it refuses
/// new runs, it does not stop runs already in flight.
#[derive(Clone)]
pub struct BudgetLedger {
    days: Collection<BudgetRecord>,
    config: BudgetConfig,
    pricing: PricingConfig,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn DocumentStore>, config: BudgetConfig, pricing: PricingConfig) -> Self {
        Self {
            days: Collection::new(store, BUDGET_COLLECTION),
            config,
            pricing,
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn pricing(&self) -> &PricingConfig {
        &self.pricing
    }

    pub async fn record_cost(&self, category: CostCategory, amount_usd: f64) -> Result<BudgetRecord> {
        let date = today();
        self.ensure_day(date).await?;
        let (record, ()) = self
            .days
            .mutate(&day_id(date), |r| r.apply(&category, amount_usd))
            .await?;
        Ok(record)
    }

    /// Count one search query. Queries inside the free daily quota cost nothing;
    /// the rest are priced as paid. Returns the category charged.
    pub async fn record_search(&self) -> Result<CostCategory> {
        let date = today();
        self.ensure_day(date).await?;
        let quota = self.pricing.free_search_daily_quota;
        let paid_price = self.pricing.paid_search_usd;
        let (_, category) = self
            .days
            .mutate(&day_id(date), |r| {
                let (category, amount) = if r.search_queries_free < quota {
                    (CostCategory::SearchFree, 0.0)
                } else {
                    (CostCategory::SearchPaid, paid_price)
                };
                r.apply(&category, amount)?;
                Ok::<_, ForageError>(category)
            })
            .await?;
        Ok(category)
    }

    /// Price a model call from the provider table and record it. Returns the cost.
    pub async fn record_ai_call(
        &self,
        provider: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<f64> {
        let cost = self.pricing.ai_cost(provider, input_tokens, output_tokens);
        self.record_cost(
            CostCategory::Ai {
                provider: provider.to_string(),
            },
            cost,
        )
        .await?;
        Ok(cost)
    }

    /// Today's record, or an empty one if nothing has been spent yet.
    pub async fn today(&self) -> Result<BudgetRecord> {
        let date = today();
        Ok(self
            .days
            .get(&day_id(date))
            .await?
            .unwrap_or_else(|| BudgetRecord::new(date)))
    }

    pub async fn monthly_totals(&self, month: &str) -> Result<MonthlyTotals> {
        let records = self
            .days
            .query(&Query::new().filter(Filter::eq("month", month)))
            .await?;
        Ok(MonthlyTotals::fold(month, &records))
    }

    pub async fn is_throttled(&self) -> Result<ThrottleState> {
        let today = self.today().await?;
        let month = self.monthly_totals(&today.month).await?;
        Ok(ThrottleState::evaluate(
            today.total_cost_usd,
            month.total_cost_usd,
            &self.config,
        ))
    }

    /// Gate for starting a discovery run. A denial is logged on today's record.
    pub async fn admit_new_run(&self) -> Result<Admission> {
        let state = self.is_throttled().await?;
        if !state.throttled {
            return Ok(Admission::Allow);
        }
        let reason = state.reason.unwrap_or_else(|| "budget throttled".to_string());
        warn!(reason = %reason, "Refusing new discovery run");

        let date = today();
        self.ensure_day(date).await?;
        let event = ThrottleEvent {
            at: Utc::now(),
            reason: reason.clone(),
        };
        self.days
            .mutate(&day_id(date), |r| {
                r.throttle_events.push(event.clone());
                Ok::<_, ForageError>(())
            })
            .await?;
        Ok(Admission::Deny(reason))
    }

    /// `admit_new_run`, with a denial surfaced as `BudgetExceeded`.
    pub async fn check_admission(&self) -> Result<()> {
        match self.admit_new_run().await? {
            Admission::Allow => Ok(()),
            Admission::Deny(reason) => Err(ForageError::BudgetExceeded { reason }),
        }
    }

    pub async fn status(&self) -> Result<BudgetStatus> {
        let today = self.today().await?;
        let month = self.monthly_totals(&today.month).await?;
        Ok(BudgetStatus::new(&today, &month, &self.config))
    }

    pub async fn log_status(&self) -> Result<()> {
        let status = self.status().await?;
        info!(
            today_usd = status.today_usd,
            month_usd = status.month_usd,
            daily_percent = status.daily_percent,
            throttled = status.throttle.throttled,
            "Budget status"
        );
        Ok(())
    }

    async fn ensure_day(&self, date: NaiveDate) -> Result<()> {
        match self.days.insert(Some(&day_id(date)), &BudgetRecord::new(date)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn current_month() -> String {
    month_key(today())
}

#[cfg(test)]
mod tests {
    use forage_store::MemoryStore;

    use super::*;

    fn ledger(config: BudgetConfig) -> BudgetLedger {
        BudgetLedger::new(Arc::new(MemoryStore::new()), config, PricingConfig::default())
    }

    #[tokio::test]
    async fn spend_at_threshold_denies_new_runs() {
        let ledger = ledger(BudgetConfig::default());
        ledger.record_cost(CostCategory::Other, 39.99).await.unwrap();
        assert_eq!(ledger.admit_new_run().await.unwrap(), Admission::Allow);

        ledger.record_cost(CostCategory::Other, 0.01).await.unwrap();
        let admission = ledger.admit_new_run().await.unwrap();
        assert!(!admission.is_allowed());

        let err = ledger.check_admission().await.unwrap_err();
        assert!(err.is_retryable());

        let today = ledger.today().await.unwrap();
        assert_eq!(today.throttle_events.len(), 2);
    }

    #[tokio::test]
    async fn free_quota_is_used_before_paid_searches() {
        let ledger = BudgetLedger::new(
            Arc::new(MemoryStore::new()),
            BudgetConfig::default(),
            PricingConfig {
                free_search_daily_quota: 2,
                ..PricingConfig::default()
            },
        );
        assert_eq!(ledger.record_search().await.unwrap(), CostCategory::SearchFree);
        assert_eq!(ledger.record_search().await.unwrap(), CostCategory::SearchFree);
        assert_eq!(ledger.record_search().await.unwrap(), CostCategory::SearchPaid);

        let today = ledger.today().await.unwrap();
        assert_eq!(today.search_queries_free, 2);
        assert_eq!(today.search_queries_paid, 1);
        assert!((today.total_cost_usd - 0.005).abs() < 1e-9);
    }

    #[tokio::test]
    async fn concurrent_costs_are_not_lost() {
        let ledger = ledger(BudgetConfig::default());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.record_cost(CostCategory::Other, 0.01).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let today = ledger.today().await.unwrap();
        assert!((today.total_cost_usd - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ai_calls_are_priced_per_provider() {
        let ledger = ledger(BudgetConfig::default());
        let cost = ledger.record_ai_call("anthropic", 2_000, 1_000).await.unwrap();
        assert!((cost - 0.021).abs() < 1e-9);
        let today = ledger.today().await.unwrap();
        assert_eq!(today.ai_calls["anthropic"], 1);
    }

    #[tokio::test]
    async fn status_reports_percentages() {
        let ledger = ledger(BudgetConfig::default());
        ledger.record_cost(CostCategory::Other, 10.0).await.unwrap();
        let status = ledger.status().await.unwrap();
        assert!((status.daily_percent - 20.0).abs() < 1e-9);
        assert!((status.monthly_percent - 1.0).abs() < 1e-9);
        assert!(!status.throttle.throttled);
        assert_eq!(status.month, current_month());
    }
}
