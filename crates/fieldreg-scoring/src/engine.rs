use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fieldreg_core::{
    AssessmentSource, HouseholdRecord, PersonRecord, VulnerabilityAssessment, WeightingProfile,
};
use fieldreg_storage::{keys, load_json, save_json, ApiClient, KeyValueStore, RemoteError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::algorithm::assess;
use crate::ScoringError;

/// Remote half of the scoring contract.
#[async_trait]
pub trait ScoringApi: Send + Sync {
    async fn calculate(
        &self,
        person_id: &str,
        force_recalculate: bool,
    ) -> Result<VulnerabilityAssessment, RemoteError>;

    async fn weighting_profile(&self) -> Result<WeightingProfile, RemoteError>;

    async fn bulk_calculate(
        &self,
        person_ids: &[String],
    ) -> Result<Vec<VulnerabilityAssessment>, RemoteError>;
}

#[async_trait]
impl ScoringApi for ApiClient {
    async fn calculate(
        &self,
        person_id: &str,
        force_recalculate: bool,
    ) -> Result<VulnerabilityAssessment, RemoteError> {
        self.calculate_assessment(person_id, force_recalculate).await
    }

    async fn weighting_profile(&self) -> Result<WeightingProfile, RemoteError> {
        self.fetch_weighting_profile().await
    }

    async fn bulk_calculate(
        &self,
        person_ids: &[String],
    ) -> Result<Vec<VulnerabilityAssessment>, RemoteError> {
        ApiClient::bulk_calculate(self, person_ids).await
    }
}

/// Scoring service constructed once per process and shared by reference.
pub struct ScoringEngine {
    api: Arc<dyn ScoringApi>,
    store: Arc<dyn KeyValueStore>,
    default_profile: WeightingProfile,
    /// Holds only profiles fetched from the backend during this process.
    profile: RwLock<Option<WeightingProfile>>,
}

impl ScoringEngine {
    pub fn new(api: Arc<dyn ScoringApi>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            api,
            store,
            default_profile: WeightingProfile::default(),
            profile: RwLock::new(None),
        }
    }

    pub fn with_default_profile(mut self, profile: WeightingProfile) -> Self {
        self.default_profile = profile;
        self
    }

    /// Remote calculation with fallback to the last cached assessment.
    pub async fn calculate_remote(
        &self,
        person_id: &str,
        force_recalculate: bool,
    ) -> Result<VulnerabilityAssessment, ScoringError> {
        match self.api.calculate(person_id, force_recalculate).await {
            Ok(mut assessment) => {
                assessment.source = AssessmentSource::Remote;
                self.cache(&assessment).await;
                Ok(assessment)
            }
            Err(err) => {
                warn!(person_id, error = %err, "remote scoring failed; trying cache");
                match self.cached_assessment(person_id).await {
                    Some(mut cached) => {
                        cached.source = AssessmentSource::LocalFallback;
                        Ok(cached)
                    }
                    None => Err(ScoringError::Remote(err)),
                }
            }
        }
    }

    /// On-device calculation. Never touches the network: the profile comes from
    /// memory, the persisted copy or the default.
    pub async fn calculate_local(
        &self,
        person: &PersonRecord,
        household: &HouseholdRecord,
    ) -> Result<VulnerabilityAssessment, ScoringError> {
        let profile = self.local_profile().await;
        let assessment = assess(person, household, &profile, Utc::now())?;
        self.cache(&assessment).await;
        Ok(assessment)
    }

    /// One round trip for many persons; a failed batch fails as a whole.
    pub async fn bulk_calculate(
        &self,
        person_ids: &[String],
    ) -> Result<Vec<VulnerabilityAssessment>, ScoringError> {
        if person_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut assessments = self.api.bulk_calculate(person_ids).await?;
        for assessment in &mut assessments {
            assessment.source = AssessmentSource::Remote;
            self.cache(assessment).await;
        }
        info!(requested = person_ids.len(), returned = assessments.len(), "bulk scoring complete");
        Ok(assessments)
    }

    /// Memory, then backend, then the last persisted copy, then the default. Never fails.
    pub async fn get_weighting_profile(&self) -> WeightingProfile {
        if let Some(profile) = self.profile.read().await.as_ref() {
            return profile.clone();
        }

        match self.api.weighting_profile().await {
            Ok(profile) => match profile.validate() {
                Ok(()) => {
                    if let Err(err) =
                        save_json(self.store.as_ref(), keys::WEIGHTING_PROFILE, &profile).await
                    {
                        warn!(error = %err, "persisting weighting profile failed");
                    }
                    *self.profile.write().await = Some(profile.clone());
                    return profile;
                }
                Err(err) => warn!(error = %err, "backend returned an invalid weighting profile"),
            },
            Err(err) => debug!(error = %err, "weighting profile fetch failed"),
        }

        self.stored_profile().await
    }

    async fn local_profile(&self) -> WeightingProfile {
        if let Some(profile) = self.profile.read().await.as_ref() {
            return profile.clone();
        }
        self.stored_profile().await
    }

    async fn stored_profile(&self) -> WeightingProfile {
        match load_json::<WeightingProfile>(self.store.as_ref(), keys::WEIGHTING_PROFILE).await {
            Ok(Some(profile)) if profile.validate().is_ok() => profile,
            Ok(_) => self.default_profile.clone(),
            Err(err) => {
                warn!(error = %err, "reading persisted weighting profile failed");
                self.default_profile.clone()
            }
        }
    }

    pub async fn cached_assessment(&self, person_id: &str) -> Option<VulnerabilityAssessment> {
        match load_json(self.store.as_ref(), &keys::assessment(person_id)).await {
            Ok(cached) => cached,
            Err(err) => {
                warn!(person_id, error = %err, "reading cached assessment failed");
                None
            }
        }
    }

    async fn cache(&self, assessment: &VulnerabilityAssessment) {
        let key = keys::assessment(&assessment.person_id);
        if let Err(err) = save_json(self.store.as_ref(), &key, assessment).await {
            warn!(person_id = %assessment.person_id, error = %err, "caching assessment failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use fieldreg_core::{Dimension, RiskLevel};
    use fieldreg_storage::MemoryStore;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeApi {
        fail: Mutex<bool>,
        profile: Mutex<Option<WeightingProfile>>,
        profile_calls: AtomicUsize,
    }

    impl FakeApi {
        async fn set_failing(&self, failing: bool) {
            *self.fail.lock().await = failing;
        }

        fn assessment(person_id: &str, score: f64) -> VulnerabilityAssessment {
            VulnerabilityAssessment {
                person_id: person_id.to_string(),
                household_id: None,
                score,
                risk_level: RiskLevel::from_score(score),
                dimension_scores: Dimension::ALL.iter().map(|d| (*d, score)).collect(),
                triggered_factors: Vec::new(),
                recommendations: Vec::new(),
                calculated_at: Utc::now(),
                source: AssessmentSource::LocalFallback,
            }
        }
    }

    #[async_trait]
    impl ScoringApi for FakeApi {
        async fn calculate(
            &self,
            person_id: &str,
            _force_recalculate: bool,
        ) -> Result<VulnerabilityAssessment, RemoteError> {
            if *self.fail.lock().await {
                return Err(RemoteError::Timeout(Duration::from_secs(10)));
            }
            Ok(Self::assessment(person_id, 72.0))
        }

        async fn weighting_profile(&self) -> Result<WeightingProfile, RemoteError> {
            self.profile_calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail.lock().await {
                return Err(RemoteError::Timeout(Duration::from_secs(10)));
            }
            self.profile
                .lock()
                .await
                .clone()
                .ok_or_else(|| RemoteError::InvalidRequest("no profile".into()))
        }

        async fn bulk_calculate(
            &self,
            person_ids: &[String],
        ) -> Result<Vec<VulnerabilityAssessment>, RemoteError> {
            if *self.fail.lock().await {
                return Err(RemoteError::HttpStatus {
                    status: 502,
                    url: "bulk".into(),
                    body: String::new(),
                });
            }
            Ok(person_ids
                .iter()
                .map(|id| Self::assessment(id, 45.0))
                .collect())
        }
    }

    fn engine(api: Arc<FakeApi>, store: Arc<MemoryStore>) -> ScoringEngine {
        ScoringEngine::new(api, store)
    }

    fn economic_heavy() -> WeightingProfile {
        WeightingProfile {
            weights: BTreeMap::from([
                (Dimension::Economic, 60.0),
                (Dimension::Housing, 10.0),
                (Dimension::Health, 10.0),
                (Dimension::Education, 10.0),
                (Dimension::Social, 10.0),
            ]),
        }
    }

    #[tokio::test]
    async fn remote_success_is_tagged_and_cached() {
        let api = Arc::new(FakeApi::default());
        let store = Arc::new(MemoryStore::new());
        let engine = engine(api, store.clone());

        let assessment = engine.calculate_remote("p-1", false).await.expect("remote");
        assert_eq!(assessment.source, AssessmentSource::Remote);
        let cached = engine.cached_assessment("p-1").await.expect("cached");
        assert_eq!(cached, assessment);
    }

    #[tokio::test]
    async fn remote_failure_falls_back_to_cache() {
        let api = Arc::new(FakeApi::default());
        let store = Arc::new(MemoryStore::new());
        let engine = engine(api.clone(), store);

        let fresh = engine.calculate_remote("p-1", false).await.expect("remote");
        api.set_failing(true).await;

        let fallback = engine.calculate_remote("p-1", true).await.expect("fallback");
        assert_eq!(fallback.source, AssessmentSource::LocalFallback);
        assert_eq!(fallback.score, fresh.score);
        assert_eq!(fallback.calculated_at, fresh.calculated_at);
    }

    #[tokio::test]
    async fn remote_failure_without_cache_propagates() {
        let api = Arc::new(FakeApi::default());
        api.set_failing(true).await;
        let engine = engine(api, Arc::new(MemoryStore::new()));

        let err = engine.calculate_remote("nobody", false).await.unwrap_err();
        assert!(matches!(err, ScoringError::Remote(RemoteError::Timeout(_))));
    }

    #[tokio::test]
    async fn local_calculation_supersedes_cache_and_is_idempotent() {
        let api = Arc::new(FakeApi::default());
        let engine = engine(api.clone(), Arc::new(MemoryStore::new()));
        engine.calculate_remote("p-1", false).await.expect("remote");
        api.set_failing(true).await;

        let person = PersonRecord::new("p-1");
        let mut household = HouseholdRecord::new("h-1", 6, 80_000.0);
        household.chronic_illness_count = 1;

        let first = engine
            .calculate_local(&person, &household)
            .await
            .expect("local");
        let mut second = engine
            .calculate_local(&person, &household)
            .await
            .expect("local again");
        assert_eq!(first.source, AssessmentSource::LocalFallback);
        assert_eq!(first.score, 62.0);

        second.calculated_at = first.calculated_at;
        assert_eq!(first, second);

        let cached = engine.cached_assessment("p-1").await.expect("cached");
        assert_eq!(cached.household_id.as_deref(), Some("h-1"));
    }

    #[tokio::test]
    async fn local_calculation_stays_offline() {
        let api = Arc::new(FakeApi::default());
        *api.profile.lock().await = Some(economic_heavy());
        let store = Arc::new(MemoryStore::new());
        let engine = engine(api.clone(), store.clone());

        let person = PersonRecord::new("p-2");
        let household = HouseholdRecord::new("h-2", 4, 200_000.0);
        for _ in 0..3 {
            engine
                .calculate_local(&person, &household)
                .await
                .expect("local");
        }
        assert_eq!(api.profile_calls.load(Ordering::SeqCst), 0);

        save_json(store.as_ref(), keys::WEIGHTING_PROFILE, &economic_heavy())
            .await
            .expect("seed");
        let with_persisted = engine
            .calculate_local(&person, &household)
            .await
            .expect("local");
        let expected = assess(&person, &household, &economic_heavy(), with_persisted.calculated_at)
            .expect("assess");
        assert_eq!(with_persisted.score, expected.score);
        assert_eq!(api.profile_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_local_input_is_not_cached() {
        let engine = engine(Arc::new(FakeApi::default()), Arc::new(MemoryStore::new()));
        let err = engine
            .calculate_local(&PersonRecord::new("p-9"), &HouseholdRecord::new("h", 0, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ScoringError::MalformedInput(_)));
        assert!(engine.cached_assessment("p-9").await.is_none());
    }

    #[tokio::test]
    async fn bulk_results_are_cached_and_batch_failure_fails_whole() {
        let api = Arc::new(FakeApi::default());
        let engine = engine(api.clone(), Arc::new(MemoryStore::new()));
        let ids = vec!["a".to_string(), "b".to_string()];

        let results = engine.bulk_calculate(&ids).await.expect("bulk");
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|a| a.source == AssessmentSource::Remote));
        assert!(engine.cached_assessment("b").await.is_some());

        api.set_failing(true).await;
        assert!(engine.bulk_calculate(&ids).await.is_err());
        assert!(engine.bulk_calculate(&[]).await.expect("empty").is_empty());
    }

    #[tokio::test]
    async fn profile_is_fetched_once_and_persisted() {
        let api = Arc::new(FakeApi::default());
        *api.profile.lock().await = Some(economic_heavy());
        let store = Arc::new(MemoryStore::new());
        let engine = engine(api.clone(), store.clone());

        assert_eq!(engine.get_weighting_profile().await, economic_heavy());
        assert_eq!(engine.get_weighting_profile().await, economic_heavy());
        assert_eq!(api.profile_calls.load(Ordering::SeqCst), 1);

        let persisted: Option<WeightingProfile> =
            load_json(store.as_ref(), keys::WEIGHTING_PROFILE).await.expect("load");
        assert_eq!(persisted, Some(economic_heavy()));
    }

    #[tokio::test]
    async fn offline_restart_uses_persisted_profile() {
        let store = Arc::new(MemoryStore::new());
        save_json(store.as_ref(), keys::WEIGHTING_PROFILE, &economic_heavy())
            .await
            .expect("seed");
        let api = Arc::new(FakeApi::default());
        api.set_failing(true).await;

        let engine = engine(api, store);
        assert_eq!(engine.get_weighting_profile().await, economic_heavy());
    }

    #[tokio::test]
    async fn invalid_or_missing_profile_falls_back_to_default() {
        let api = Arc::new(FakeApi::default());
        let mut broken = economic_heavy();
        broken.weights.insert(Dimension::Economic, 90.0);
        *api.profile.lock().await = Some(broken);
        let engine = engine(api.clone(), Arc::new(MemoryStore::new()));
        assert_eq!(engine.get_weighting_profile().await, WeightingProfile::default());

        api.set_failing(true).await;
        let custom = ScoringEngine::new(api, Arc::new(MemoryStore::new()))
            .with_default_profile(economic_heavy());
        assert_eq!(custom.get_weighting_profile().await, economic_heavy());
    }
}
