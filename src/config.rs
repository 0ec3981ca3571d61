use crate::domain::{CycleBoundary, Decimal, Rank};
use crate::engine::PlacementPolicy;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub settlement: SettlementConfig,
    /// Ancestors credited per PV event; None propagates to the root.
    pub max_propagation_depth: Option<u32>,
    pub cycle_boundary: CycleBoundary,
    pub placement: PlacementConfig,
    pub settlement_concurrency: usize,
    pub ledger_timeout_ms: u64,
    pub scheduler_enabled: bool,
}

/// Rates and ceilings consumed by the matching engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementConfig {
    pub pv_to_currency_rate: Decimal,
    pub daily_cap_per_rank: BTreeMap<Rank, Decimal>,
    /// Lifetime matching income ceiling as a multiple of the joining package.
    pub lifetime_cap_multiplier: Option<Decimal>,
}

impl SettlementConfig {
    pub fn new(pv_to_currency_rate: Decimal) -> Self {
        Self {
            pv_to_currency_rate,
            daily_cap_per_rank: BTreeMap::new(),
            lifetime_cap_multiplier: None,
        }
    }

    pub fn with_daily_cap(mut self, rank: &str, cap: Decimal) -> Self {
        self.daily_cap_per_rank.insert(Rank::new(rank), cap);
        self
    }

    pub fn with_lifetime_cap_multiplier(mut self, multiplier: Decimal) -> Self {
        self.lifetime_cap_multiplier = Some(multiplier);
        self
    }

    pub fn daily_cap_for(&self, rank: &Rank) -> Option<Decimal> {
        self.daily_cap_per_rank.get(rank).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementConfig {
    pub policy: PlacementPolicy,
    /// Deepest level a new node may occupy (root = 0).
    pub max_depth: Option<u32>,
    pub max_size: Option<u64>,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            policy: PlacementPolicy::Spillover,
            max_depth: None,
            max_size: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_or(&env_map, "PORT", 8080u16, "must be a valid u16")?;

        let database_path = required(&env_map, "DATABASE_PATH")?;

        let rate_str = required(&env_map, "PV_TO_CURRENCY_RATE")?;
        let pv_to_currency_rate = parse_positive_decimal("PV_TO_CURRENCY_RATE", &rate_str)?;

        let caps_str = required(&env_map, "DAILY_CAP_PER_RANK")?;
        let daily_cap_per_rank = parse_rank_caps(&caps_str)?;

        let lifetime_cap_multiplier = env_map
            .get("LIFETIME_CAP_MULTIPLIER")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| parse_positive_decimal("LIFETIME_CAP_MULTIPLIER", s))
            .transpose()?;

        let max_propagation_depth = parse_optional_limit::<u32>(&env_map, "MAX_PROPAGATION_DEPTH")?;

        let cycle_boundary = required(&env_map, "CYCLE_BOUNDARY")?
            .parse::<CycleBoundary>()
            .map_err(|e| ConfigError::InvalidValue("CYCLE_BOUNDARY".to_string(), e.to_string()))?;

        let policy = match env_map
            .get("PLACEMENT_POLICY")
            .map(|s| s.as_str())
            .unwrap_or("spillover")
        {
            "spillover" => PlacementPolicy::Spillover,
            "outer-leg" => PlacementPolicy::OuterLeg,
            "direct" => PlacementPolicy::Direct,
            other => {
                return Err(ConfigError::InvalidValue(
                    "PLACEMENT_POLICY".to_string(),
                    format!("must be spillover, outer-leg, or direct, got {}", other),
                ))
            }
        };

        let placement = PlacementConfig {
            policy,
            max_depth: parse_optional_limit::<u32>(&env_map, "MAX_TREE_DEPTH")?,
            max_size: parse_optional_limit::<u64>(&env_map, "MAX_TREE_SIZE")?,
        };

        let settlement_concurrency =
            parse_or(&env_map, "SETTLEMENT_CONCURRENCY", 4usize, "must be a positive integer")?;
        if settlement_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "SETTLEMENT_CONCURRENCY".to_string(),
                "must be a positive integer".to_string(),
            ));
        }

        let ledger_timeout_ms =
            parse_or(&env_map, "LEDGER_TIMEOUT_MS", 5000u64, "must be a valid u64")?;

        let scheduler_enabled = match env_map
            .get("SCHEDULER_ENABLED")
            .map(|s| s.as_str())
            .unwrap_or("true")
        {
            "true" | "1" => true,
            "false" | "0" => false,
            other => {
                return Err(ConfigError::InvalidValue(
                    "SCHEDULER_ENABLED".to_string(),
                    format!("must be true or false, got {}", other),
                ))
            }
        };

        Ok(Config {
            port,
            database_path,
            settlement: SettlementConfig {
                pv_to_currency_rate,
                daily_cap_per_rank,
                lifetime_cap_multiplier,
            },
            max_propagation_depth,
            cycle_boundary,
            placement,
            settlement_concurrency,
            ledger_timeout_ms,
            scheduler_enabled,
        })
    }
}

fn required(env_map: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    env_map
        .get(key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
}

fn parse_or<T: std::str::FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
    hint: &str,
) -> Result<T, ConfigError> {
    match env_map.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), hint.to_string())),
    }
}

/// Absent or `unlimited` means no limit.
fn parse_optional_limit<T: std::str::FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match env_map.get(key).map(|s| s.trim()) {
        None | Some("") | Some("unlimited") => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            ConfigError::InvalidValue(
                key.to_string(),
                "must be a non-negative integer or 'unlimited'".to_string(),
            )
        }),
    }
}

fn parse_positive_decimal(key: &str, raw: &str) -> Result<Decimal, ConfigError> {
    let value = Decimal::from_str_canonical(raw).map_err(|_| {
        ConfigError::InvalidValue(key.to_string(), format!("not a decimal: {}", raw))
    })?;
    if !value.is_positive() {
        return Err(ConfigError::InvalidValue(
            key.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

/// Parse `rank=amount` pairs separated by commas.
fn parse_rank_caps(raw: &str) -> Result<BTreeMap<Rank, Decimal>, ConfigError> {
    let invalid = |msg: String| ConfigError::InvalidValue("DAILY_CAP_PER_RANK".to_string(), msg);
    let mut caps = BTreeMap::new();

    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (rank, amount) = entry
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected rank=amount, got {}", entry)))?;
        let rank = Rank::new(rank);
        if rank.as_str().is_empty() {
            return Err(invalid(format!("empty rank in {}", entry)));
        }
        let amount = Decimal::from_str_canonical(amount)
            .map_err(|_| invalid(format!("not a decimal amount: {}", amount.trim())))?;
        if amount.is_negative() {
            return Err(invalid(format!("negative cap for {}", rank)));
        }
        if caps.insert(rank.clone(), amount).is_some() {
            return Err(invalid(format!("duplicate rank {}", rank)));
        }
    }

    if caps.is_empty() {
        return Err(invalid("at least one rank cap is required".to_string()));
    }
    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DATABASE_PATH".to_string(), "/tmp/test.db".to_string());
        map.insert("PV_TO_CURRENCY_RATE".to_string(), "25".to_string());
        map.insert(
            "DAILY_CAP_PER_RANK".to_string(),
            "basic=250, Standard=500".to_string(),
        );
        map.insert("CYCLE_BOUNDARY".to_string(), "00:00".to_string());
        map
    }

    fn expect_missing(key: &str) {
        let mut env_map = setup_required_env();
        env_map.remove(key);
        match Config::from_env_map(env_map) {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, key),
            other => panic!("Expected MissingEnv for {}, got {:?}", key, other.map(|_| ())),
        }
    }

    fn expect_invalid(key: &str, value: &str) {
        let mut env_map = setup_required_env();
        env_map.insert(key.to_string(), value.to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, key),
            other => panic!("Expected InvalidValue for {}, got {:?}", key, other.map(|_| ())),
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(setup_required_env()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_propagation_depth, None);
        assert_eq!(config.placement.policy, PlacementPolicy::Spillover);
        assert_eq!(config.settlement_concurrency, 4);
        assert_eq!(config.ledger_timeout_ms, 5000);
        assert!(config.scheduler_enabled);
        assert!(config.settlement.lifetime_cap_multiplier.is_none());
        assert_eq!(
            config.settlement.daily_cap_for(&Rank::new("standard")),
            Some(Decimal::from_str_canonical("500").unwrap())
        );
    }

    #[test]
    fn test_required_keys() {
        expect_missing("DATABASE_PATH");
        expect_missing("PV_TO_CURRENCY_RATE");
        expect_missing("DAILY_CAP_PER_RANK");
        expect_missing("CYCLE_BOUNDARY");
    }

    #[test]
    fn test_invalid_values() {
        expect_invalid("PORT", "not_a_number");
        expect_invalid("PV_TO_CURRENCY_RATE", "0");
        expect_invalid("PV_TO_CURRENCY_RATE", "abc");
        expect_invalid("DAILY_CAP_PER_RANK", "basic");
        expect_invalid("DAILY_CAP_PER_RANK", "basic=1,basic=2");
        expect_invalid("DAILY_CAP_PER_RANK", "basic=-5");
        expect_invalid("CYCLE_BOUNDARY", "25:00");
        expect_invalid("PLACEMENT_POLICY", "random");
        expect_invalid("MAX_PROPAGATION_DEPTH", "-1");
        expect_invalid("SETTLEMENT_CONCURRENCY", "0");
        expect_invalid("LIFETIME_CAP_MULTIPLIER", "-2");
        expect_invalid("SCHEDULER_ENABLED", "maybe");
    }

    #[test]
    fn test_optional_limits() {
        let mut env_map = setup_required_env();
        env_map.insert("MAX_PROPAGATION_DEPTH".to_string(), "10".to_string());
        env_map.insert("MAX_TREE_DEPTH".to_string(), "unlimited".to_string());
        env_map.insert("MAX_TREE_SIZE".to_string(), "1000".to_string());
        env_map.insert("LIFETIME_CAP_MULTIPLIER".to_string(), "3".to_string());
        env_map.insert("PLACEMENT_POLICY".to_string(), "outer-leg".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.max_propagation_depth, Some(10));
        assert_eq!(config.placement.max_depth, None);
        assert_eq!(config.placement.max_size, Some(1000));
        assert_eq!(config.placement.policy, PlacementPolicy::OuterLeg);
        assert_eq!(
            config.settlement.lifetime_cap_multiplier,
            Some(Decimal::from_str_canonical("3").unwrap())
        );
    }
}
