use crate::{
    bandit_engine::DEFAULT_ALLOCATION_DRAWS,
    error::{EngineError, EngineResult},
    grade::GradeThresholds,
    types::FunctionCode,
    variance_controller::{FunctionParameters, ModelTier, RuleConfig},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub master_seed:                 u64,
    pub grading_interval_minutes:    u32,
    pub allocation_interval_minutes: u32,
    pub variance_interval_minutes:   u32,
    /// Trailing metric window evaluated on each variance pass.
    pub variance_window_minutes:     u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            master_seed:                 42,
            grading_interval_minutes:    24 * 60,
            allocation_interval_minutes: 15,
            variance_interval_minutes:   60,
            variance_window_minutes:     60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditConfig {
    pub allocation_draws: u32,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self { allocation_draws: DEFAULT_ALLOCATION_DRAWS }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub function_code: FunctionCode,
    pub parameters:    FunctionParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VarianceConfig {
    pub functions: Vec<FunctionConfig>,
    pub rules:     Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub schedule: ScheduleConfig,
    pub grading:  GradeThresholds,
    pub bandit:   BanditConfig,
    pub variance: VarianceConfig,
}

impl EngineConfig {
    /// Load from the data/ directory.
    /// In tests, use EngineConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let dir = Path::new(data_dir);
        let config = Self {
            schedule: read_json(&dir.join("engine/schedule.json"))?,
            grading:  read_json(&dir.join("grading/grade_thresholds.json"))?,
            bandit:   read_json(&dir.join("bandit/bandit_config.json"))?,
            variance: read_json(&dir.join("variance/correction_rules.json"))?,
        };
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid config in {data_dir}: {e}"))?;
        Ok(config)
    }

    /// Structural checks. Individual correction rules are validated when
    /// the controller loads them so one bad rule only disables itself.
    pub fn validate(&self) -> EngineResult<()> {
        self.grading.validate()?;
        if self.bandit.allocation_draws == 0 {
            return Err(EngineError::InvalidConfig("allocation_draws must be positive".into()));
        }
        let s = &self.schedule;
        for (name, minutes) in [
            ("grading_interval_minutes", s.grading_interval_minutes),
            ("allocation_interval_minutes", s.allocation_interval_minutes),
            ("variance_interval_minutes", s.variance_interval_minutes),
            ("variance_window_minutes", s.variance_window_minutes),
        ] {
            if minutes == 0 {
                return Err(EngineError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn default_test() -> Self {
        let rule = |rule_id: &str,
                    function_code: &str,
                    metric: &str,
                    threshold: f64,
                    unit: &str,
                    action: &str,
                    parameters: serde_json::Value,
                    requires_approval: bool| RuleConfig {
            rule_id:                 rule_id.into(),
            function_code:           function_code.into(),
            metric:                  metric.into(),
            operator:                ">".into(),
            threshold:               serde_json::json!(threshold),
            unit:                    unit.into(),
            action:                  action.into(),
            parameters:              parameters.as_object().cloned().unwrap_or_default(),
            max_corrections_per_day: 3,
            cooldown_minutes:        60,
            requires_approval,
        };

        Self {
            schedule: ScheduleConfig::default(),
            grading:  GradeThresholds::default(),
            bandit:   BanditConfig::default(),
            variance: VarianceConfig {
                functions: vec![
                    FunctionConfig {
                        function_code: "donor_outreach_sms".into(),
                        parameters:    FunctionParameters {
                            model_tier:            ModelTier::Premium,
                            batch_size:            500,
                            rate_limit_per_minute: None,
                            paused:                false,
                        },
                    },
                    FunctionConfig {
                        function_code: "voice_script_generation".into(),
                        parameters:    FunctionParameters {
                            model_tier:            ModelTier::Premium,
                            batch_size:            50,
                            rate_limit_per_minute: Some(120),
                            paused:                false,
                        },
                    },
                ],
                rules: vec![
                    rule(
                        "sms_cost_overrun",
                        "donor_outreach_sms",
                        "cost_variance_pct",
                        20.0,
                        "percent",
                        "downgrade_model_tier",
                        serde_json::json!({}),
                        false,
                    ),
                    rule(
                        "sms_runaway_spend",
                        "donor_outreach_sms",
                        "cost_variance_pct",
                        50.0,
                        "percent",
                        "throttle_batch_size",
                        serde_json::json!({ "factor": 0.5, "min_batch_size": 50 }),
                        false,
                    ),
                    rule(
                        "voice_cost_overrun",
                        "voice_script_generation",
                        "cost_variance_pct",
                        30.0,
                        "percent",
                        "pause_function",
                        serde_json::json!({}),
                        true,
                    ),
                ],
            },
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Cannot parse {}: {e}", path.display()))
}
