//! Subscription Filters
//!
//! Declarative per-subscription predicates evaluated against outbound
//! payloads. A field missing from the payload never fails a predicate;
//! only present values are checked.

use std::collections::BTreeSet;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::streaming::StreamType;

/// Declarative filter attached to a client subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionFilter {
    /// Symbol allow list. Empty means every symbol.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub symbols: BTreeSet<String>,
    /// Symbol deny list.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub exclude_symbols: BTreeSet<String>,
    /// Timeframe allow list (`1m`, `1h`, ...).
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub timeframes: BTreeSet<String>,
    /// Indicator type allow list (`rsi`, `macd`, ...).
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub indicator_types: BTreeSet<String>,
    /// Indicator period allow list.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub indicator_periods: BTreeSet<u32>,
    /// Signal type allow list (`buy`, `sell`, ...).
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub signal_types: BTreeSet<String>,
    /// Minimum signal confidence (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<Decimal>,
    /// Maximum signal confidence (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_confidence: Option<Decimal>,
    /// Minimum traded volume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_volume: Option<Decimal>,
    /// Minimum absolute price change in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_price_change: Option<Decimal>,
    /// Execution session allow list.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub session_ids: BTreeSet<String>,
}

impl SubscriptionFilter {
    /// Filter that accepts everything.
    #[must_use]
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Build a filter from subscribe-request params.
    ///
    /// # Errors
    ///
    /// Returns the serde error when `params` does not describe a filter.
    pub fn from_params(params: &Value) -> Result<Self, serde_json::Error> {
        if params.is_null() {
            return Ok(Self::default());
        }
        let filter: Self = serde_json::from_value(params.clone())?;
        Ok(filter.normalized())
    }

    /// Restrict to the given symbols.
    #[must_use]
    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self.normalized()
    }

    /// Canonical form: symbols upper case, type names lower case.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.symbols = upper(&self.symbols);
        self.exclude_symbols = upper(&self.exclude_symbols);
        self.timeframes = lower(&self.timeframes);
        self.indicator_types = lower(&self.indicator_types);
        self.signal_types = lower(&self.signal_types);
        self
    }

    /// Evaluate the stream-specific predicate against a payload.
    #[must_use]
    pub fn matches(&self, stream: StreamType, data: &Value) -> bool {
        match stream {
            StreamType::MarketData => {
                self.symbol_matches(data)
                    && self.timeframe_matches(data)
                    && at_least(self.min_volume, decimal_field(data, &["volume"]))
                    && at_least(
                        self.min_price_change,
                        decimal_field(data, &["price_change_pct", "change_percent"])
                            .map(|d| d.abs()),
                    )
            }
            StreamType::Indicators => {
                self.symbol_matches(data)
                    && self.timeframe_matches(data)
                    && in_set(&self.indicator_types, lower_field(data, "indicator_type"))
                    && self.period_matches(data)
            }
            StreamType::Signals => {
                let confidence = decimal_field(data, &["confidence"]);
                self.symbol_matches(data)
                    && in_set(&self.signal_types, lower_field(data, "signal_type"))
                    && at_least(self.min_confidence, confidence)
                    && at_most(self.max_confidence, confidence)
            }
            StreamType::Orders | StreamType::Portfolio => self.symbol_matches(data),
            StreamType::ExecutionProgress | StreamType::ExecutionResult => in_set(
                &self.session_ids,
                match data.get("session_id") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                },
            ),
            StreamType::SystemStatus => true,
        }
    }

    fn symbol_matches(&self, data: &Value) -> bool {
        let Some(symbol) = data
            .get("symbol")
            .and_then(Value::as_str)
            .map(str::to_uppercase)
        else {
            return true;
        };

        if self.exclude_symbols.contains(&symbol) {
            return false;
        }
        self.symbols.is_empty() || self.symbols.contains(&symbol)
    }

    fn timeframe_matches(&self, data: &Value) -> bool {
        in_set(&self.timeframes, lower_field(data, "timeframe"))
    }

    fn period_matches(&self, data: &Value) -> bool {
        if self.indicator_periods.is_empty() {
            return true;
        }
        data.get("period")
            .and_then(Value::as_u64)
            .and_then(|p| u32::try_from(p).ok())
            .is_none_or(|p| self.indicator_periods.contains(&p))
    }
}

fn upper(set: &BTreeSet<String>) -> BTreeSet<String> {
    set.iter().map(|s| s.trim().to_uppercase()).collect()
}

fn lower(set: &BTreeSet<String>) -> BTreeSet<String> {
    set.iter().map(|s| s.trim().to_lowercase()).collect()
}

fn lower_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_lowercase)
}

fn in_set(allowed: &BTreeSet<String>, value: Option<String>) -> bool {
    allowed.is_empty() || value.is_none_or(|v| allowed.contains(&v))
}

fn at_least(min: Option<Decimal>, value: Option<Decimal>) -> bool {
    match (min, value) {
        (Some(min), Some(value)) => value >= min,
        _ => true,
    }
}

fn at_most(max: Option<Decimal>, value: Option<Decimal>) -> bool {
    match (max, value) {
        (Some(max), Some(value)) => value <= max,
        _ => true,
    }
}

/// Read the first present key as a decimal. Accepts JSON numbers and
/// numeric strings.
fn decimal_field(data: &Value, keys: &[&str]) -> Option<Decimal> {
    keys.iter().find_map(|key| data.get(*key)).and_then(|v| match v {
        Value::Number(n) => parse_decimal(&n.to_string()),
        Value::String(s) => parse_decimal(s),
        _ => None,
    })
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn dec(raw: &str) -> Decimal {
        Decimal::from_str(raw).unwrap()
    }

    #[test]
    fn symbol_allow_list() {
        let filter = SubscriptionFilter::default().with_symbols(["btc_usdt"]);

        assert!(filter.matches(StreamType::MarketData, &json!({"symbol": "BTC_USDT"})));
        assert!(!filter.matches(StreamType::MarketData, &json!({"symbol": "ETH_USDT"})));
    }

    #[test]
    fn deny_list_wins_over_allow_list() {
        let filter = SubscriptionFilter {
            symbols: ["AAPL".to_string()].into(),
            exclude_symbols: ["aapl".to_string()].into(),
            ..Default::default()
        }
        .normalized();

        assert!(!filter.matches(StreamType::Orders, &json!({"symbol": "AAPL"})));
    }

    #[test]
    fn missing_field_does_not_fail_predicate() {
        let filter = SubscriptionFilter::default().with_symbols(["AAPL"]);
        assert!(filter.matches(StreamType::MarketData, &json!({"price": 1})));
    }

    #[test]
    fn market_data_numeric_minimums() {
        let filter = SubscriptionFilter {
            min_volume: Some(dec("1000")),
            min_price_change: Some(dec("2.5")),
            ..Default::default()
        };

        assert!(filter.matches(
            StreamType::MarketData,
            &json!({"symbol": "X", "volume": 1500, "price_change_pct": -3.1})
        ));
        assert!(!filter.matches(
            StreamType::MarketData,
            &json!({"symbol": "X", "volume": "999.5", "price_change_pct": 5})
        ));
        assert!(!filter.matches(
            StreamType::MarketData,
            &json!({"symbol": "X", "volume": 5000, "change_percent": 1.0})
        ));
    }

    #[test]
    fn indicator_type_and_period() {
        let filter = SubscriptionFilter {
            indicator_types: ["RSI".to_string()].into(),
            indicator_periods: [14].into(),
            ..Default::default()
        }
        .normalized();

        assert!(filter.matches(
            StreamType::Indicators,
            &json!({"symbol": "A", "indicator_type": "rsi", "period": 14})
        ));
        assert!(!filter.matches(
            StreamType::Indicators,
            &json!({"symbol": "A", "indicator_type": "rsi", "period": 7})
        ));
        assert!(!filter.matches(
            StreamType::Indicators,
            &json!({"symbol": "A", "indicator_type": "macd", "period": 14})
        ));
    }

    #[test]
    fn signal_confidence_bounds() {
        let filter = SubscriptionFilter {
            signal_types: ["buy".to_string()].into(),
            min_confidence: Some(dec("0.6")),
            max_confidence: Some(dec("0.9")),
            ..Default::default()
        };

        let signal = |confidence: f64| json!({"symbol": "A", "signal_type": "BUY", "confidence": confidence});

        assert!(filter.matches(StreamType::Signals, &signal(0.75)));
        assert!(!filter.matches(StreamType::Signals, &signal(0.5)));
        assert!(!filter.matches(StreamType::Signals, &signal(0.95)));
    }

    #[test]
    fn execution_streams_filter_by_session() {
        let filter = SubscriptionFilter {
            session_ids: ["s1".to_string()].into(),
            ..Default::default()
        };
        assert!(filter.matches(StreamType::ExecutionProgress, &json!({"session_id": "s1"})));
        assert!(!filter.matches(StreamType::ExecutionResult, &json!({"session_id": "s2"})));
    }

    #[test]
    fn numeric_session_id_matches_its_string_form() {
        let filter = SubscriptionFilter {
            session_ids: ["42".to_string()].into(),
            ..Default::default()
        };
        assert!(filter.matches(StreamType::ExecutionProgress, &json!({"session_id": 42})));
        assert!(!filter.matches(StreamType::ExecutionResult, &json!({"session_id": 43})));
    }

    #[test]
    fn from_params_parses_and_normalizes() {
        let filter = SubscriptionFilter::from_params(&json!({
            "symbols": ["btc_usdt"],
            "timeframes": ["1H"],
            "min_volume": "10.5"
        }))
        .unwrap();

        assert!(filter.symbols.contains("BTC_USDT"));
        assert!(filter.timeframes.contains("1h"));
        assert_eq!(filter.min_volume, Some(dec("10.5")));
        assert_eq!(
            SubscriptionFilter::from_params(&Value::Null).unwrap(),
            SubscriptionFilter::default()
        );
        assert!(SubscriptionFilter::from_params(&json!({"symbols": 5})).is_err());
    }

    #[test]
    fn decimal_field_accepts_scientific_notation() {
        assert_eq!(
            decimal_field(&json!({"volume": "1e3"}), &["volume"]),
            Some(dec("1000"))
        );
    }
}
