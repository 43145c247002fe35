// src/alarms/condition.rs - Predicates deciding whether an alarm is active
use crate::error::{Result, VigilError};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Alarm condition types
///
/// # Examples
///
/// ```rust
/// use vigil::alarms::AlarmCondition;
/// use vigil::Value;
///
/// let down = AlarmCondition::value("DOWN");
/// assert!(down.evaluate(&Value::from("DOWN")));
/// assert!(!down.evaluate(&Value::from("UP")));
///
/// let band = AlarmCondition::Range { min: 0.0, max: 10.0, outside: true };
/// assert!(band.evaluate(&Value::Float(12.5)));
/// assert!(!band.evaluate(&Value::Int(5)));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlarmCondition {
    /// Active when the value equals `value`
    Value { value: Value },

    /// Active inside `[min, max]`, or outside it when `outside` is set
    Range {
        min: f64,
        max: f64,
        #[serde(default)]
        outside: bool,
    },

    /// Active when the value exceeds threshold
    High { threshold: f64 },

    /// Active when the value is below threshold
    Low { threshold: f64 },
}

impl AlarmCondition {
    pub fn value(value: impl Into<Value>) -> Self {
        AlarmCondition::Value { value: value.into() }
    }

    /// Whether `value` puts the alarm in the active state.
    ///
    /// Values that cannot be compared numerically never activate a numeric
    /// condition.
    pub fn evaluate(&self, value: &Value) -> bool {
        match self {
            AlarmCondition::Value { value: expected } => value.loosely_equals(expected),
            AlarmCondition::Range { min, max, outside } => match value.as_float() {
                Some(v) if !v.is_nan() => {
                    let inside = v >= *min && v <= *max;
                    inside != *outside
                }
                _ => false,
            },
            AlarmCondition::High { threshold } => value.as_float().is_some_and(|v| v > *threshold),
            AlarmCondition::Low { threshold } => value.as_float().is_some_and(|v| v < *threshold),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            AlarmCondition::Value { .. } => Ok(()),
            AlarmCondition::Range { min, max, .. } => {
                if !min.is_finite() || !max.is_finite() {
                    return Err(VigilError::InvalidInput("range bounds must be finite".into()));
                }
                if min > max {
                    return Err(VigilError::InvalidInput(format!(
                        "range minimum {} is greater than maximum {}",
                        min, max
                    )));
                }
                Ok(())
            }
            AlarmCondition::High { threshold } | AlarmCondition::Low { threshold } => {
                if threshold.is_finite() {
                    Ok(())
                } else {
                    Err(VigilError::InvalidInput("threshold must be finite".into()))
                }
            }
        }
    }
}

impl fmt::Display for AlarmCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmCondition::Value { value } => write!(f, "value == {}", value),
            AlarmCondition::Range { min, max, outside: false } => write!(f, "{} <= value <= {}", min, max),
            AlarmCondition::Range { min, max, outside: true } => write!(f, "value outside [{}, {}]", min, max),
            AlarmCondition::High { threshold } => write!(f, "value > {}", threshold),
            AlarmCondition::Low { threshold } => write!(f, "value < {}", threshold),
        }
    }
}
