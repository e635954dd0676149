//! Session event normalization.
//!
//! Producers nest the interesting fields under different keys. Every event
//! is flattened once at the boundary:
//!
//! ```text
//! payload < data < progress (object) < result < top-level keys
//! ```
//!
//! Later sources overwrite earlier ones, so a top-level key always wins.

use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};

/// Nested keys in increasing precedence.
const NESTED_KEYS: [&str; 4] = ["payload", "data", "progress", "result"];

/// Nesting depth beyond which objects are kept as plain values.
const MAX_DEPTH: usize = 4;

/// A flattened session event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedEvent {
    fields: Map<String, Value>,
}

impl NormalizedEvent {
    /// Flatten a raw event payload.
    #[must_use]
    pub fn new(raw: &Value) -> Self {
        let mut fields = Map::new();
        if let Value::Object(top) = raw {
            flatten_into(&mut fields, top, 0);
        }
        Self { fields }
    }

    /// All flattened fields.
    #[must_use]
    pub const fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.first(&["session_id", "sessionId"]).and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    /// Command that started the session.
    #[must_use]
    pub fn command_type(&self) -> Option<String> {
        self.string(&["command_type", "commandType", "command"])
    }

    /// Explicit percentage, clamped to `[0, 100]`.
    #[must_use]
    pub fn percentage(&self) -> Option<f64> {
        self.number(&["progress_percentage", "percentage", "percent", "progress"])
            .map(|p| p.clamp(0.0, 100.0))
    }

    /// Steps completed.
    #[must_use]
    pub fn current_step(&self) -> Option<u64> {
        self.count(&["current_step", "step", "steps_completed"])
    }

    /// Total steps.
    #[must_use]
    pub fn total_steps(&self) -> Option<u64> {
        self.count(&["total_steps"]).filter(|t| *t > 0)
    }

    /// Records collected.
    #[must_use]
    pub fn records_collected(&self) -> Option<u64> {
        self.count(&["records_collected", "records", "total_records"])
    }

    /// Estimated seconds remaining.
    #[must_use]
    pub fn eta_seconds(&self) -> Option<f64> {
        self.number(&["eta_seconds", "estimated_time_remaining", "eta"])
            .map(|eta| eta.max(0.0))
    }

    /// Human-readable status.
    #[must_use]
    pub fn status_message(&self) -> Option<String> {
        self.string(&["status_message", "message", "current_stage"])
    }

    /// Error description.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.first(&["error", "error_message"]).and_then(|v| match v {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
    }

    /// An object-valued field. `performance_metrics` also accepts `metrics`
    /// and `performance`.
    #[must_use]
    pub fn object(&self, key: &str) -> Option<Map<String, Value>> {
        let aliases: &[&str] = match key {
            "performance_metrics" => &["performance_metrics", "metrics", "performance"],
            _ => &[key],
        };
        self.first(aliases).and_then(Value::as_object).cloned()
    }

    /// Heuristic total steps from date range, timeframe and symbol count.
    #[must_use]
    pub fn estimated_total_steps(&self) -> Option<u64> {
        let start = self.date(&["start_date", "startDate"])?;
        let end = self.date(&["end_date", "endDate"])?;
        let timeframe = self.string(&["timeframe", "interval"])?;
        estimate_total_steps(start, end, &timeframe, self.symbol_count())
    }

    fn symbol_count(&self) -> usize {
        match self.first(&["symbols", "symbol"]) {
            Some(Value::Array(items)) => items.len(),
            Some(Value::String(s)) => s.split(',').filter(|p| !p.trim().is_empty()).count(),
            _ => 0,
        }
    }

    fn first(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .find_map(|key| self.fields.get(*key).filter(|v| !v.is_null()))
    }

    fn string(&self, keys: &[&str]) -> Option<String> {
        self.first(keys)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn number(&self, keys: &[&str]) -> Option<f64> {
        keys.iter().find_map(|key| match self.fields.get(*key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .filter(|n| n.is_finite())
    }

    fn count(&self, keys: &[&str]) -> Option<u64> {
        let n = self.number(keys)?;
        if n < 0.0 {
            return None;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let count = n.round() as u64;
        Some(count)
    }

    fn date(&self, keys: &[&str]) -> Option<NaiveDate> {
        let raw = self.string(keys)?;
        parse_date(&raw)
    }
}

fn flatten_into(out: &mut Map<String, Value>, obj: &Map<String, Value>, depth: usize) {
    if depth < MAX_DEPTH {
        for key in NESTED_KEYS {
            if let Some(Value::Object(nested)) = obj.get(key) {
                flatten_into(out, nested, depth + 1);
            }
        }
    }

    for (key, value) in obj {
        if NESTED_KEYS.contains(&key.as_str()) && value.is_object() && depth < MAX_DEPTH {
            continue;
        }
        out.insert(key.clone(), value.clone());
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

// =============================================================================
// Step Estimation
// =============================================================================

/// Bars per trading day for a timeframe like `1m`, `4h`, `1d` or `1w`.
///
/// `Nm` → 1440/N, `Nh` → 24/N, `Nd` → 1/N, `Nw` → 1/(7N).
#[must_use]
pub fn bars_per_day(timeframe: &str) -> Option<f64> {
    let tf = timeframe.trim().to_lowercase();
    let tf = tf.strip_suffix("in").unwrap_or(&tf);
    let unit = tf.chars().last()?;
    let digits = &tf[..tf.len() - unit.len_utf8()];
    let n: f64 = if digits.is_empty() { 1.0 } else { digits.parse().ok()? };
    if n <= 0.0 {
        return None;
    }

    match unit {
        'm' => Some(1440.0 / n),
        'h' => Some(24.0 / n),
        'd' => Some(1.0 / n),
        'w' => Some(1.0 / (7.0 * n)),
        _ => None,
    }
}

/// Estimate the total steps of a replay: `ceil(days × bars/day) × max(1, symbols)`,
/// never less than one.
#[must_use]
pub fn estimate_total_steps(
    start: NaiveDate,
    end: NaiveDate,
    timeframe: &str,
    symbols: usize,
) -> Option<u64> {
    let bars = bars_per_day(timeframe)?;
    let days = (end - start).num_days().max(1);

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let per_symbol = ((days as f64) * bars).ceil().max(1.0) as u64;

    Some(per_symbol.saturating_mul(symbols.max(1) as u64).max(1))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test]
    fn top_level_wins_over_nested() {
        let event = NormalizedEvent::new(&json!({
            "payload": {"records_collected": 1, "message": "payload"},
            "data": {"records_collected": 2},
            "progress": {"records_collected": 3},
            "result": {"records_collected": 4},
            "records_collected": 5,
        }));

        assert_eq!(event.records_collected(), Some(5));
        assert_eq!(event.status_message().as_deref(), Some("payload"));
    }

    #[test]
    fn nested_precedence_order() {
        let event = NormalizedEvent::new(&json!({
            "payload": {"current_step": 1},
            "data": {"current_step": 2},
            "progress": {"current_step": 3},
        }));
        assert_eq!(event.current_step(), Some(3));

        let event = NormalizedEvent::new(&json!({
            "progress": {"current_step": 3},
            "result": {"current_step": 4},
        }));
        assert_eq!(event.current_step(), Some(4));
    }

    #[test]
    fn numeric_progress_is_a_percentage() {
        let event = NormalizedEvent::new(&json!({"progress": 142.0}));
        assert_eq!(event.percentage(), Some(100.0));

        let event = NormalizedEvent::new(&json!({"data": {"percentage": "42.5"}}));
        assert_eq!(event.percentage(), Some(42.5));
    }

    #[test]
    fn session_id_aliases() {
        assert_eq!(
            NormalizedEvent::new(&json!({"data": {"sessionId": "abc"}})).session_id(),
            Some("abc".to_string())
        );
        assert_eq!(NormalizedEvent::new(&json!({"session_id": ""})).session_id(), None);
        assert_eq!(NormalizedEvent::new(&json!("not an object")).session_id(), None);
    }

    #[test_case("1m", 1440.0 ; "one minute")]
    #[test_case("5m", 288.0 ; "five minutes")]
    #[test_case("1min", 1440.0 ; "min suffix")]
    #[test_case("4h", 6.0 ; "four hours")]
    #[test_case("1d", 1.0 ; "daily")]
    #[test_case("1w", 1.0 / 7.0 ; "weekly")]
    fn timeframe_bars(tf: &str, expected: f64) {
        assert!((bars_per_day(tf).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn unknown_timeframe_has_no_estimate() {
        assert_eq!(bars_per_day("1y"), None);
        assert_eq!(bars_per_day("0m"), None);
        assert_eq!(bars_per_day(""), None);
    }

    #[test]
    fn step_estimate_from_event() {
        let event = NormalizedEvent::new(&json!({
            "data": {
                "start_date": "2024-01-01",
                "end_date": "2024-01-11",
                "timeframe": "1h",
                "symbols": ["AAPL", "MSFT"],
            }
        }));
        // 10 days × 24 bars × 2 symbols
        assert_eq!(event.estimated_total_steps(), Some(480));
    }

    #[test]
    fn step_estimate_floors() {
        let d = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        assert_eq!(
            estimate_total_steps(d("2024-01-01"), d("2024-01-01"), "1w", 0),
            Some(1)
        );
        assert_eq!(
            estimate_total_steps(d("2024-01-01"), d("2024-01-31"), "1w", 1),
            Some(5)
        );
    }
}
