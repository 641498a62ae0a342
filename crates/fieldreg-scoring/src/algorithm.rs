//! Five-dimension checklist scoring.
//!
//! Every dimension sums additive points from its indicator checklist and is
//! clamped to `[0, 100]`. The global score is the profile-weighted mean of the
//! dimension scores. All arithmetic stays in `f64`; rounding to two decimals
//! happens once, when the assessment is built.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fieldreg_core::{
    AssessmentSource, Dimension, DwellingType, EducationLevel, EmploymentStatus, HouseholdRecord,
    PersonRecord, RiskFactor, RiskLevel, VulnerabilityAssessment, WeightingProfile,
};

use crate::recommendations::recommendations_for;
use crate::ScoringError;

/// Monthly income per capita, FCFA.
pub const EXTREME_POVERTY_LINE: f64 = 15_000.0;
pub const POVERTY_LINE: f64 = 30_000.0;

const UNEMPLOYMENT_POINTS: f64 = 25.0;
const EXTREME_POVERTY_POINTS: f64 = 50.0;
const POVERTY_POINTS: f64 = 30.0;
const MANY_DEPENDENTS_POINTS: f64 = 25.0;
const SOME_DEPENDENTS_POINTS: f64 = 12.0;
const NO_SAVINGS_POINTS: f64 = 15.0;

const PRECARIOUS_DWELLING_POINTS: f64 = 30.0;
const INFORMAL_DWELLING_POINTS: f64 = 15.0;
const NO_ELECTRICITY_POINTS: f64 = 25.0;
const NO_WATER_POINTS: f64 = 25.0;
const SEVERE_CROWDING_POINTS: f64 = 20.0;
const CROWDING_POINTS: f64 = 10.0;
const NO_SANITATION_POINTS: f64 = 20.0;

const CHRONIC_ILLNESS_POINTS: f64 = 30.0;
const DISABILITY_POINTS: f64 = 25.0;
const NO_INSURANCE_POINTS: f64 = 25.0;
const MALNUTRITION_POINTS: f64 = 25.0;
const REMOTE_CARE_POINTS: f64 = 15.0;
const DISTANT_CARE_POINTS: f64 = 8.0;

const NO_SCHOOLING_POINTS: f64 = 35.0;
const PRIMARY_ONLY_POINTS: f64 = 20.0;
const ILLITERACY_POINTS: f64 = 25.0;
const OUT_OF_SCHOOL_POINTS_EACH: f64 = 15.0;
const OUT_OF_SCHOOL_POINTS_CAP: f64 = 30.0;
const UNPAID_FEES_POINTS: f64 = 15.0;

const ISOLATION_POINTS: f64 = 30.0;
const SINGLE_PARENT_POINTS: f64 = 25.0;
const ELDERLY_ALONE_POINTS: f64 = 30.0;
const NO_FAMILY_SUPPORT_POINTS: f64 = 20.0;

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionBreakdown {
    pub dimension: Dimension,
    pub score: f64,
    pub factors: Vec<RiskFactor>,
}

#[derive(Debug, Default)]
struct Tally {
    points: f64,
    factors: Vec<RiskFactor>,
}

impl Tally {
    fn add(&mut self, factor: RiskFactor, points: f64) {
        self.points += points;
        self.factors.push(factor);
    }

    fn add_if(&mut self, condition: bool, factor: RiskFactor, points: f64) {
        if condition {
            self.add(factor, points);
        }
    }

    fn finish(self, dimension: Dimension) -> DimensionBreakdown {
        DimensionBreakdown {
            dimension,
            score: self.points.clamp(0.0, 100.0),
            factors: self.factors,
        }
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Rejects records no amount of retrying could score.
pub fn validate_input(person: &PersonRecord, household: &HouseholdRecord) -> Result<(), ScoringError> {
    if household.size == 0 {
        return Err(ScoringError::MalformedInput(format!(
            "household {} has size 0",
            household.id
        )));
    }
    if !household.monthly_income.is_finite() || household.monthly_income < 0.0 {
        return Err(ScoringError::MalformedInput(format!(
            "household {} has invalid monthly income {}",
            household.id, household.monthly_income
        )));
    }
    if household.rooms == Some(0) {
        return Err(ScoringError::MalformedInput(format!(
            "household {} reports 0 rooms",
            household.id
        )));
    }
    if let Some(distance) = household.distance_to_health_km {
        if !distance.is_finite() || distance < 0.0 {
            return Err(ScoringError::MalformedInput(format!(
                "household {} has invalid distance to care {distance}",
                household.id
            )));
        }
    }
    if let Some(household_id) = &person.household_id {
        if household_id != &household.id {
            return Err(ScoringError::MalformedInput(format!(
                "person {} belongs to household {household_id}, not {}",
                person.id, household.id
            )));
        }
    }
    Ok(())
}

pub fn income_per_capita(household: &HouseholdRecord) -> f64 {
    household.monthly_income / f64::from(household.size.max(1))
}

/// Recorded dependents, or members not counted as earners.
pub fn dependents(household: &HouseholdRecord) -> u32 {
    household.dependents.unwrap_or_else(|| {
        household
            .size
            .saturating_sub(household.earners.unwrap_or(1))
    })
}

fn economic(person: &PersonRecord, household: &HouseholdRecord) -> DimensionBreakdown {
    let mut tally = Tally::default();
    tally.add_if(
        person.employment_status == EmploymentStatus::Unemployed,
        RiskFactor::Unemployment,
        UNEMPLOYMENT_POINTS,
    );

    let per_capita = income_per_capita(household);
    if per_capita < EXTREME_POVERTY_LINE {
        tally.add(RiskFactor::ExtremePoverty, EXTREME_POVERTY_POINTS);
    } else if per_capita < POVERTY_LINE {
        tally.add(RiskFactor::Poverty, POVERTY_POINTS);
    }

    match dependents(household) {
        n if n >= 4 => tally.add(RiskFactor::ManyDependents, MANY_DEPENDENTS_POINTS),
        n if n >= 2 => tally.add(RiskFactor::SomeDependents, SOME_DEPENDENTS_POINTS),
        _ => {}
    }

    tally.add_if(!household.has_savings, RiskFactor::NoSavings, NO_SAVINGS_POINTS);
    tally.finish(Dimension::Economic)
}

fn housing(household: &HouseholdRecord) -> DimensionBreakdown {
    let mut tally = Tally::default();
    match household.dwelling_type {
        DwellingType::Precarious => {
            tally.add(RiskFactor::PrecariousDwelling, PRECARIOUS_DWELLING_POINTS)
        }
        DwellingType::Informal => tally.add(RiskFactor::InformalDwelling, INFORMAL_DWELLING_POINTS),
        DwellingType::Permanent | DwellingType::Unknown => {}
    }
    tally.add_if(
        !household.has_electricity,
        RiskFactor::NoElectricity,
        NO_ELECTRICITY_POINTS,
    );
    tally.add_if(!household.has_water, RiskFactor::NoWater, NO_WATER_POINTS);

    if let Some(rooms) = household.rooms.filter(|r| *r > 0) {
        let per_room = f64::from(household.size) / f64::from(rooms);
        if per_room > 3.0 {
            tally.add(RiskFactor::SevereCrowding, SEVERE_CROWDING_POINTS);
        } else if per_room > 2.0 {
            tally.add(RiskFactor::Crowding, CROWDING_POINTS);
        }
    }

    tally.add_if(
        !household.has_sanitation,
        RiskFactor::NoSanitation,
        NO_SANITATION_POINTS,
    );
    tally.finish(Dimension::Housing)
}

fn health(person: &PersonRecord, household: &HouseholdRecord) -> DimensionBreakdown {
    let mut tally = Tally::default();
    tally.add_if(
        person.has_chronic_illness || household.chronic_illness_count > 0,
        RiskFactor::ChronicIllness,
        CHRONIC_ILLNESS_POINTS,
    );
    tally.add_if(
        person.has_disability || household.disabled_members > 0,
        RiskFactor::Disability,
        DISABILITY_POINTS,
    );
    tally.add_if(
        !household.has_health_insurance,
        RiskFactor::NoHealthInsurance,
        NO_INSURANCE_POINTS,
    );
    tally.add_if(
        person.is_malnourished || household.malnourished_members > 0,
        RiskFactor::Malnutrition,
        MALNUTRITION_POINTS,
    );
    match household.distance_to_health_km {
        Some(km) if km > 10.0 => tally.add(RiskFactor::RemoteHealthCare, REMOTE_CARE_POINTS),
        Some(km) if km > 5.0 => tally.add(RiskFactor::DistantHealthCare, DISTANT_CARE_POINTS),
        _ => {}
    }
    tally.finish(Dimension::Health)
}

fn education(person: &PersonRecord, household: &HouseholdRecord) -> DimensionBreakdown {
    let mut tally = Tally::default();
    match person.education_level {
        EducationLevel::None => tally.add(RiskFactor::NoSchooling, NO_SCHOOLING_POINTS),
        EducationLevel::Primary => tally.add(RiskFactor::PrimarySchoolingOnly, PRIMARY_ONLY_POINTS),
        EducationLevel::Secondary | EducationLevel::Higher | EducationLevel::Unknown => {}
    }
    tally.add_if(
        person.is_literate == Some(false),
        RiskFactor::Illiteracy,
        ILLITERACY_POINTS,
    );
    if household.out_of_school_children > 0 {
        let points = (OUT_OF_SCHOOL_POINTS_EACH * f64::from(household.out_of_school_children))
            .min(OUT_OF_SCHOOL_POINTS_CAP);
        tally.add(RiskFactor::OutOfSchoolChildren, points);
    }
    tally.add_if(
        household.has_unpaid_school_fees,
        RiskFactor::UnpaidSchoolFees,
        UNPAID_FEES_POINTS,
    );
    tally.finish(Dimension::Education)
}

fn social(household: &HouseholdRecord) -> DimensionBreakdown {
    let mut tally = Tally::default();
    tally.add_if(
        household.socially_isolated,
        RiskFactor::SocialIsolation,
        ISOLATION_POINTS,
    );
    tally.add_if(
        household.single_parent,
        RiskFactor::SingleParent,
        SINGLE_PARENT_POINTS,
    );
    tally.add_if(
        household.elderly_living_alone,
        RiskFactor::ElderlyLivingAlone,
        ELDERLY_ALONE_POINTS,
    );
    tally.add_if(
        !household.has_family_support,
        RiskFactor::NoFamilySupport,
        NO_FAMILY_SUPPORT_POINTS,
    );
    tally.finish(Dimension::Social)
}

/// Unrounded, clamped per-dimension scores in `Dimension::ALL` order.
pub fn dimension_breakdown(person: &PersonRecord, household: &HouseholdRecord) -> Vec<DimensionBreakdown> {
    vec![
        economic(person, household),
        housing(household),
        health(person, household),
        education(person, household),
        social(household),
    ]
}

/// Weighted sum of dimension scores; weights are percentages summing to 100.
pub fn global_score(dimension_scores: &BTreeMap<Dimension, f64>, profile: &WeightingProfile) -> f64 {
    let total: f64 = Dimension::ALL
        .iter()
        .map(|d| profile.weight(*d) * dimension_scores.get(d).copied().unwrap_or(0.0))
        .sum();
    (total / 100.0).clamp(0.0, 100.0)
}

pub fn assess(
    person: &PersonRecord,
    household: &HouseholdRecord,
    profile: &WeightingProfile,
    calculated_at: DateTime<Utc>,
) -> Result<VulnerabilityAssessment, ScoringError> {
    validate_input(person, household)?;
    profile.validate()?;

    let breakdown = dimension_breakdown(person, household);
    let raw_scores: BTreeMap<Dimension, f64> =
        breakdown.iter().map(|b| (b.dimension, b.score)).collect();
    let triggered_factors: Vec<RiskFactor> = breakdown
        .into_iter()
        .flat_map(|b| b.factors)
        .collect();

    let score = global_score(&raw_scores, profile);
    let risk_level = RiskLevel::from_score(score);
    let recommendations = recommendations_for(risk_level, &triggered_factors);

    Ok(VulnerabilityAssessment {
        person_id: person.id.clone(),
        household_id: Some(household.id.clone()),
        score: round2(score),
        risk_level,
        dimension_scores: raw_scores
            .into_iter()
            .map(|(d, s)| (d, round2(s)))
            .collect(),
        triggered_factors,
        recommendations,
        calculated_at,
        source: AssessmentSource::LocalFallback,
    })
}
