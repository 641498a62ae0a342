//! Core domain model shared by the sync queue and the scoring engine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fieldreg-core";

pub const CRITICAL_THRESHOLD: f64 = 80.0;
pub const HIGH_THRESHOLD: f64 = 60.0;
pub const MODERATE_THRESHOLD: f64 = 40.0;

/// Closed set of mutations the outbox knows how to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    CreatePerson,
    UpdatePerson,
    CreateHousehold,
    SubmitSurvey,
    UploadDocument,
}

impl MutationKind {
    pub const ALL: [MutationKind; 5] = [
        MutationKind::CreatePerson,
        MutationKind::UpdatePerson,
        MutationKind::CreateHousehold,
        MutationKind::SubmitSurvey,
        MutationKind::UploadDocument,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::CreatePerson => "CREATE_PERSON",
            MutationKind::UpdatePerson => "UPDATE_PERSON",
            MutationKind::CreateHousehold => "CREATE_HOUSEHOLD",
            MutationKind::SubmitSurvey => "SUBMIT_SURVEY",
            MutationKind::UploadDocument => "UPLOAD_DOCUMENT",
        }
    }

    /// Uploads carry file bodies and get the long timeout.
    pub fn is_upload(&self) -> bool {
        matches!(self, MutationKind::UploadDocument)
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown mutation kind `{0}`")]
pub struct UnknownMutationKind(pub String);

impl FromStr for MutationKind {
    type Err = UnknownMutationKind;

    /// Accepts both the wire form (`CREATE_PERSON`) and the kebab form (`create-person`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_").to_ascii_uppercase();
        MutationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownMutationKind(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Pending,
    InFlight,
    Failed,
    /// Transient marker; synced items are deleted rather than stored with this status.
    Synced,
    DeadLetter,
}

impl QueueStatus {
    /// Counted by the pending badge.
    pub fn is_pending(&self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::Failed)
    }

    /// Picked up by a drain. `InFlight` here means a previous process died mid-submit.
    pub fn is_drainable(&self) -> bool {
        matches!(
            self,
            QueueStatus::Pending | QueueStatus::Failed | QueueStatus::InFlight
        )
    }
}

/// A pending mutation awaiting delivery to the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: MutationKind,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub status: QueueStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn new(kind: MutationKind, payload: JsonValue, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            created_at,
            attempts: 0,
            status: QueueStatus::Pending,
            last_error: None,
            last_attempt_at: None,
        }
    }
}

/// Snapshot reported by the platform connectivity monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub is_connected: bool,
    pub is_internet_reachable: bool,
}

impl ConnectivityState {
    pub fn online() -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: true,
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Economic,
    Housing,
    Health,
    Education,
    Social,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::Economic,
        Dimension::Housing,
        Dimension::Health,
        Dimension::Education,
        Dimension::Social,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Economic => "economic",
            Dimension::Housing => "housing",
            Dimension::Health => "health",
            Dimension::Education => "education",
            Dimension::Social => "social",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    /// Step function over the global score; each tier's lower bound is inclusive.
    pub fn from_score(score: f64) -> Self {
        if score >= CRITICAL_THRESHOLD {
            RiskLevel::Critical
        } else if score >= HIGH_THRESHOLD {
            RiskLevel::High
        } else if score >= MODERATE_THRESHOLD {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Moderate => "MODERATE",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssessmentSource {
    #[default]
    Remote,
    LocalFallback,
}

/// Checklist indicators that contributed points to a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskFactor {
    Unemployment,
    ExtremePoverty,
    Poverty,
    ManyDependents,
    SomeDependents,
    NoSavings,
    PrecariousDwelling,
    InformalDwelling,
    NoElectricity,
    NoWater,
    SevereCrowding,
    Crowding,
    NoSanitation,
    ChronicIllness,
    Disability,
    NoHealthInsurance,
    Malnutrition,
    RemoteHealthCare,
    DistantHealthCare,
    NoSchooling,
    PrimarySchoolingOnly,
    Illiteracy,
    OutOfSchoolChildren,
    UnpaidSchoolFees,
    SocialIsolation,
    SingleParent,
    ElderlyLivingAlone,
    NoFamilySupport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationCode {
    ImmediateFieldVisit,
    EmergencyCashTransfer,
    PriorityFollowUp,
    CashTransferEnrollment,
    QuarterlyMonitoring,
    AnnualReview,
    EmploymentSupport,
    BasicServicesConnection,
    HousingImprovement,
    HealthReferral,
    HealthInsuranceEnrollment,
    NutritionSupport,
    LiteracyProgram,
    SchoolReintegration,
    SchoolFeeWaiver,
    CommunitySupportLinkage,
    ChildcareSupport,
}

/// Output of the scoring engine for one person and household.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityAssessment {
    pub person_id: String,
    #[serde(default)]
    pub household_id: Option<String>,
    pub score: f64,
    pub risk_level: RiskLevel,
    pub dimension_scores: BTreeMap<Dimension, f64>,
    #[serde(default)]
    pub triggered_factors: Vec<RiskFactor>,
    pub recommendations: Vec<RecommendationCode>,
    pub calculated_at: DateTime<Utc>,
    #[serde(default)]
    pub source: AssessmentSource,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProfileError {
    #[error("weighting profile is missing dimension `{0}`")]
    MissingDimension(&'static str),
    #[error("weight for `{dimension}` must be a finite non-negative number, got {weight}")]
    InvalidWeight { dimension: &'static str, weight: f64 },
    #[error("weights must sum to 100, got {0}")]
    BadTotal(f64),
}

/// Per-dimension percentage weights used to combine dimension scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightingProfile {
    pub weights: BTreeMap<Dimension, f64>,
}

impl Default for WeightingProfile {
    fn default() -> Self {
        Self {
            weights: BTreeMap::from([
                (Dimension::Economic, 35.0),
                (Dimension::Housing, 25.0),
                (Dimension::Health, 20.0),
                (Dimension::Education, 10.0),
                (Dimension::Social, 10.0),
            ]),
        }
    }
}

impl WeightingProfile {
    const TOTAL_TOLERANCE: f64 = 0.01;

    pub fn weight(&self, dimension: Dimension) -> f64 {
        self.weights.get(&dimension).copied().unwrap_or(0.0)
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        let mut total = 0.0;
        for dimension in Dimension::ALL {
            let weight = *self
                .weights
                .get(&dimension)
                .ok_or(ProfileError::MissingDimension(dimension.as_str()))?;
            if !weight.is_finite() || weight < 0.0 {
                return Err(ProfileError::InvalidWeight {
                    dimension: dimension.as_str(),
                    weight,
                });
            }
            total += weight;
        }
        if (total - 100.0).abs() > Self::TOTAL_TOLERANCE {
            return Err(ProfileError::BadTotal(total));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentStatus {
    Employed,
    SelfEmployed,
    Unemployed,
    Inactive,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EducationLevel {
    None,
    Primary,
    Secondary,
    Higher,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DwellingType {
    Permanent,
    /// Semi-permanent or informal construction.
    Informal,
    /// Makeshift shelter, tent or ruin.
    Precarious,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    NationalId,
    BirthCertificate,
    Photo,
    ProofOfResidence,
    MedicalRecord,
    Other,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::NationalId => "NATIONAL_ID",
            DocumentType::BirthCertificate => "BIRTH_CERTIFICATE",
            DocumentType::Photo => "PHOTO",
            DocumentType::ProofOfResidence => "PROOF_OF_RESIDENCE",
            DocumentType::MedicalRecord => "MEDICAL_RECORD",
            DocumentType::Other => "OTHER",
        }
    }
}

/// Payload of an `UPLOAD_DOCUMENT` queue item. The capture pipeline hands over
/// a file already written to disk; the bytes are read at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpload {
    pub person_id: String,
    pub document_type: DocumentType,
    pub file_path: PathBuf,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl DocumentUpload {
    pub fn file_name(&self) -> String {
        self.file_name.clone().unwrap_or_else(|| {
            self.file_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string())
        })
    }

    pub fn mime_type(&self) -> &str {
        self.mime_type
            .as_deref()
            .unwrap_or("application/octet-stream")
    }
}

/// The surveyed person, treated as the household head for head-specific indicators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: String,
    #[serde(default)]
    pub household_id: Option<String>,
    #[serde(default)]
    pub employment_status: EmploymentStatus,
    #[serde(default)]
    pub education_level: EducationLevel,
    #[serde(default)]
    pub is_literate: Option<bool>,
    #[serde(default)]
    pub has_chronic_illness: bool,
    #[serde(default)]
    pub has_disability: bool,
    #[serde(default)]
    pub is_malnourished: bool,
}

impl PersonRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            household_id: None,
            employment_status: EmploymentStatus::Unknown,
            education_level: EducationLevel::Unknown,
            is_literate: None,
            has_chronic_illness: false,
            has_disability: false,
            is_malnourished: false,
        }
    }
}

/// Household facts captured by the survey form.
///
/// `has_*` facts default to `false`: a form that did not record an amenity
/// counts it as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdRecord {
    pub id: String,
    pub size: u32,
    /// Monthly household income in FCFA.
    pub monthly_income: f64,
    #[serde(default)]
    pub earners: Option<u32>,
    #[serde(default)]
    pub dependents: Option<u32>,
    #[serde(default)]
    pub has_savings: bool,
    #[serde(default)]
    pub dwelling_type: DwellingType,
    #[serde(default)]
    pub has_electricity: bool,
    #[serde(default)]
    pub has_water: bool,
    #[serde(default)]
    pub has_sanitation: bool,
    #[serde(default)]
    pub rooms: Option<u32>,
    #[serde(default)]
    pub chronic_illness_count: u32,
    #[serde(default)]
    pub disabled_members: u32,
    #[serde(default)]
    pub malnourished_members: u32,
    #[serde(default)]
    pub has_health_insurance: bool,
    #[serde(default)]
    pub distance_to_health_km: Option<f64>,
    #[serde(default)]
    pub out_of_school_children: u32,
    #[serde(default)]
    pub has_unpaid_school_fees: bool,
    #[serde(default)]
    pub socially_isolated: bool,
    #[serde(default)]
    pub single_parent: bool,
    #[serde(default)]
    pub elderly_living_alone: bool,
    #[serde(default)]
    pub has_family_support: bool,
}

impl HouseholdRecord {
    pub fn new(id: impl Into<String>, size: u32, monthly_income: f64) -> Self {
        Self {
            id: id.into(),
            size,
            monthly_income,
            earners: None,
            dependents: None,
            has_savings: false,
            dwelling_type: DwellingType::Unknown,
            has_electricity: false,
            has_water: false,
            has_sanitation: false,
            rooms: None,
            chronic_illness_count: 0,
            disabled_members: 0,
            malnourished_members: 0,
            has_health_insurance: false,
            distance_to_health_km: None,
            out_of_school_children: 0,
            has_unpaid_school_fees: false,
            socially_isolated: false,
            single_parent: false,
            elderly_living_alone: false,
            has_family_support: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_kind_parses_wire_and_kebab_forms() {
        assert_eq!(
            "CREATE_PERSON".parse::<MutationKind>().unwrap(),
            MutationKind::CreatePerson
        );
        assert_eq!(
            "upload-document".parse::<MutationKind>().unwrap(),
            MutationKind::UploadDocument
        );
        assert!("DELETE_PERSON".parse::<MutationKind>().is_err());
    }

    #[test]
    fn queue_item_serializes_kind_as_type() {
        let item = QueueItem::new(
            MutationKind::SubmitSurvey,
            serde_json::json!({"session": 1}),
            Utc::now(),
        );
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["type"], "SUBMIT_SURVEY");
        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["attempts"], 0);
    }

    #[test]
    fn risk_level_boundaries_are_inclusive_on_upper_tier() {
        assert_eq!(RiskLevel::from_score(79.9), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(80.0), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(60.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(59.99), RiskLevel::Moderate);
        assert_eq!(RiskLevel::from_score(40.0), RiskLevel::Moderate);
        assert_eq!(RiskLevel::from_score(39.99), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Low);
    }

    #[test]
    fn risk_level_is_monotonic() {
        let mut previous = RiskLevel::Low;
        for step in 0..=1000 {
            let level = RiskLevel::from_score(step as f64 / 10.0);
            assert!(level >= previous);
            previous = level;
        }
    }

    #[test]
    fn default_profile_is_valid() {
        WeightingProfile::default().validate().unwrap();
    }

    #[test]
    fn profile_validation_rejects_bad_totals_and_gaps() {
        let mut profile = WeightingProfile::default();
        profile.weights.insert(Dimension::Social, 20.0);
        assert!(matches!(profile.validate(), Err(ProfileError::BadTotal(_))));

        profile.weights.remove(&Dimension::Social);
        assert_eq!(
            profile.validate(),
            Err(ProfileError::MissingDimension("social"))
        );

        let mut negative = WeightingProfile::default();
        negative.weights.insert(Dimension::Economic, -5.0);
        negative.weights.insert(Dimension::Housing, 65.0);
        assert!(matches!(
            negative.validate(),
            Err(ProfileError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn connectivity_requires_both_signals() {
        assert!(ConnectivityState::online().is_online());
        assert!(!ConnectivityState {
            is_connected: true,
            is_internet_reachable: false
        }
        .is_online());
        assert!(!ConnectivityState::offline().is_online());
    }

    #[test]
    fn document_upload_falls_back_to_path_file_name() {
        let upload: DocumentUpload = serde_json::from_value(serde_json::json!({
            "person_id": "p-1",
            "document_type": "NATIONAL_ID",
            "file_path": "/captures/id-front.jpg"
        }))
        .unwrap();
        assert_eq!(upload.file_name(), "id-front.jpg");
        assert_eq!(upload.mime_type(), "application/octet-stream");
    }

    #[test]
    fn household_defaults_treat_amenities_as_absent() {
        let household: HouseholdRecord =
            serde_json::from_str(r#"{"id":"h1","size":3,"monthly_income":50000}"#).unwrap();
        assert!(!household.has_electricity);
        assert!(!household.has_savings);
        assert_eq!(household.dwelling_type, DwellingType::Unknown);
        assert_eq!(household.rooms, None);
    }
}
