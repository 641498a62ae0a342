//! Deterministic rule table mapping (risk level, triggered factor) to recommendation codes.

use fieldreg_core::{RecommendationCode, RiskFactor, RiskLevel};

/// Factor-specific additions, applied in table order after the baseline.
const FACTOR_RULES: &[(RiskFactor, RecommendationCode)] = &[
    (RiskFactor::ExtremePoverty, RecommendationCode::CashTransferEnrollment),
    (RiskFactor::Unemployment, RecommendationCode::EmploymentSupport),
    (RiskFactor::NoElectricity, RecommendationCode::BasicServicesConnection),
    (RiskFactor::NoWater, RecommendationCode::BasicServicesConnection),
    (RiskFactor::NoSanitation, RecommendationCode::BasicServicesConnection),
    (RiskFactor::PrecariousDwelling, RecommendationCode::HousingImprovement),
    (RiskFactor::ChronicIllness, RecommendationCode::HealthReferral),
    (RiskFactor::Disability, RecommendationCode::HealthReferral),
    (RiskFactor::NoHealthInsurance, RecommendationCode::HealthInsuranceEnrollment),
    (RiskFactor::Malnutrition, RecommendationCode::NutritionSupport),
    (RiskFactor::Illiteracy, RecommendationCode::LiteracyProgram),
    (RiskFactor::OutOfSchoolChildren, RecommendationCode::SchoolReintegration),
    (RiskFactor::UnpaidSchoolFees, RecommendationCode::SchoolFeeWaiver),
    (RiskFactor::SocialIsolation, RecommendationCode::CommunitySupportLinkage),
    (RiskFactor::ElderlyLivingAlone, RecommendationCode::CommunitySupportLinkage),
    (RiskFactor::NoFamilySupport, RecommendationCode::CommunitySupportLinkage),
    (RiskFactor::SingleParent, RecommendationCode::ChildcareSupport),
];

pub fn baseline(level: RiskLevel) -> &'static [RecommendationCode] {
    match level {
        RiskLevel::Critical => &[
            RecommendationCode::ImmediateFieldVisit,
            RecommendationCode::EmergencyCashTransfer,
        ],
        RiskLevel::High => &[
            RecommendationCode::PriorityFollowUp,
            RecommendationCode::CashTransferEnrollment,
        ],
        RiskLevel::Moderate => &[RecommendationCode::QuarterlyMonitoring],
        RiskLevel::Low => &[RecommendationCode::AnnualReview],
    }
}

pub fn recommendations_for(level: RiskLevel, factors: &[RiskFactor]) -> Vec<RecommendationCode> {
    let mut out: Vec<RecommendationCode> = Vec::new();
    let mut push = |code: RecommendationCode| {
        if !out.contains(&code) {
            out.push(code);
        }
    };

    for code in baseline(level) {
        push(*code);
    }
    for (factor, code) in FACTOR_RULES {
        if factors.contains(factor) {
            push(*code);
        }
    }
    out
}
