//! Letter grades and the percentile → grade step function.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Contribution grade. Declaration order is ascending so the derived
/// `Ord` matches `A++ > A+ > ... > D > U`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "U")]
    U,
    #[serde(rename = "D")]
    D,
    #[serde(rename = "C-")]
    CMinus,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "C+")]
    CPlus,
    #[serde(rename = "B-")]
    BMinus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "A-")]
    AMinus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A++")]
    APlusPlus,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::APlusPlus => "A++",
            Self::APlus => "A+",
            Self::A => "A",
            Self::AMinus => "A-",
            Self::BPlus => "B+",
            Self::B => "B",
            Self::BMinus => "B-",
            Self::CPlus => "C+",
            Self::C => "C",
            Self::CMinus => "C-",
            Self::D => "D",
            Self::U => "U",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grade {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        let grade = match s.trim() {
            "A++" => Self::APlusPlus,
            "A+" => Self::APlus,
            "A" => Self::A,
            "A-" => Self::AMinus,
            "B+" => Self::BPlus,
            "B" => Self::B,
            "B-" => Self::BMinus,
            "C+" => Self::CPlus,
            "C" => Self::C,
            "C-" => Self::CMinus,
            "D" => Self::D,
            "U" => Self::U,
            other => {
                return Err(EngineError::invalid_input("grade", format!("unknown grade '{other}'")))
            }
        };
        Ok(grade)
    }
}

/// One band of the threshold table: percentiles `>= min_percentile` earn `grade`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradeBand {
    pub min_percentile: f64,
    pub grade:          Grade,
}

/// Ordered threshold table, highest band first. Anything below the last
/// band earns `floor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeThresholds {
    pub bands: Vec<GradeBand>,
    pub floor: Grade,
}

impl Default for GradeThresholds {
    fn default() -> Self {
        let band = |min_percentile, grade| GradeBand { min_percentile, grade };
        Self {
            bands: vec![
                band(99.9, Grade::APlusPlus),
                band(99.0, Grade::APlus),
                band(95.0, Grade::A),
                band(90.0, Grade::AMinus),
                band(80.0, Grade::BPlus),
                band(70.0, Grade::B),
                band(60.0, Grade::BMinus),
                band(50.0, Grade::CPlus),
                band(40.0, Grade::C),
                band(30.0, Grade::CMinus),
            ],
            floor: Grade::D,
        }
    }
}

impl GradeThresholds {
    /// Check the table is a strictly descending step function.
    pub fn validate(&self) -> EngineResult<()> {
        if self.bands.is_empty() {
            return Err(EngineError::InvalidConfig("grade table has no bands".into()));
        }
        if self.floor == Grade::U {
            return Err(EngineError::InvalidConfig("grade floor cannot be U".into()));
        }
        for band in &self.bands {
            if !band.min_percentile.is_finite() || !(0.0..=100.0).contains(&band.min_percentile) {
                return Err(EngineError::InvalidConfig(format!(
                    "band {} has percentile {} outside [0, 100]",
                    band.grade, band.min_percentile
                )));
            }
            if band.grade <= self.floor {
                return Err(EngineError::InvalidConfig(format!(
                    "band {} does not rank above floor {}",
                    band.grade, self.floor
                )));
            }
        }
        for pair in self.bands.windows(2) {
            if pair[1].min_percentile >= pair[0].min_percentile || pair[1].grade >= pair[0].grade {
                return Err(EngineError::InvalidConfig(format!(
                    "bands {} and {} are not strictly descending",
                    pair[0].grade, pair[1].grade
                )));
            }
        }
        Ok(())
    }

    /// Highest band whose lower bound the percentile reaches.
    pub fn grade_for(&self, percentile: f64) -> Grade {
        self.bands
            .iter()
            .find(|band| percentile >= band.min_percentile)
            .map(|band| band.grade)
            .unwrap_or(self.floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grade_order_matches_ladder() {
        let ladder = [
            "A++", "A+", "A", "A-", "B+", "B", "B-", "C+", "C", "C-", "D", "U",
        ];
        let grades: Vec<Grade> = ladder.iter().map(|s| s.parse().unwrap()).collect();
        for pair in grades.windows(2) {
            assert!(pair[0] > pair[1], "{} should outrank {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn band_lower_bounds_are_inclusive() {
        let t = GradeThresholds::default();
        assert_eq!(t.grade_for(100.0), Grade::APlusPlus);
        assert_eq!(t.grade_for(99.9), Grade::APlusPlus);
        assert_eq!(t.grade_for(99.899), Grade::APlus);
        assert_eq!(t.grade_for(95.0), Grade::A);
        assert_eq!(t.grade_for(50.0), Grade::CPlus);
        assert_eq!(t.grade_for(49.999), Grade::C);
        assert_eq!(t.grade_for(30.0), Grade::CMinus);
        assert_eq!(t.grade_for(29.999), Grade::D);
        assert_eq!(t.grade_for(0.0), Grade::D);
    }

    #[test]
    fn default_table_is_valid() {
        assert!(GradeThresholds::default().validate().is_ok());
    }

    #[test]
    fn unordered_table_rejected() {
        let mut t = GradeThresholds::default();
        t.bands.swap(0, 1);
        assert!(matches!(t.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn serde_uses_letter_form() {
        let json = serde_json::to_string(&Grade::APlusPlus).unwrap();
        assert_eq!(json, "\"A++\"");
        let back: Grade = serde_json::from_str("\"C-\"").unwrap();
        assert_eq!(back, Grade::CMinus);
    }
}
