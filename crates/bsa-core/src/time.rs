use crate::error::{CoreError, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FhirDateTime(pub OffsetDateTime);

impl FhirDateTime {
    pub fn new(datetime: OffsetDateTime) -> Self {
        Self(datetime)
    }

    pub fn inner(&self) -> &OffsetDateTime {
        &self.0
    }

    pub fn into_inner(self) -> OffsetDateTime {
        self.0
    }
}

impl fmt::Display for FhirDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = self
            .0
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|_| fmt::Error)?;
        write!(f, "{formatted}")
    }
}

impl FromStr for FhirDateTime {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let datetime = OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)
            .map_err(|e| {
                CoreError::invalid_date_time(format!("Failed to parse FHIR DateTime '{s}': {e}"))
            })?;
        Ok(FhirDateTime(datetime))
    }
}

impl Serialize for FhirDateTime {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let formatted = self
            .0
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }
}

impl<'de> Deserialize<'de> for FhirDateTime {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FhirDateTime::from_str(&s).map_err(serde::de::Error::custom)
    }
}

pub fn now_utc() -> FhirDateTime {
    FhirDateTime(OffsetDateTime::now_utc())
}

static ISO_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(-)?P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?)?$",
    )
    .expect("static duration pattern compiles")
});

const SECONDS_PER_DAY: f64 = 86_400.0;

/// A relative time offset as carried by artifact timing data and related actions.
///
/// Accepts either an ISO-8601 duration string (`P1D`, `-PT24H`, `P1DT2H`) or a
/// FHIR Duration quantity (`{"value": 1, "unit": "d"}`). Months count as 30 days
/// and years as 365 days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FhirDuration(time::Duration);

impl FhirDuration {
    pub fn new(duration: time::Duration) -> Self {
        Self(duration)
    }

    pub fn as_duration(&self) -> time::Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Resolve the offset against an instant, producing the fire instant.
    ///
    /// Fails when the result falls outside the representable date range.
    pub fn after(&self, instant: OffsetDateTime) -> Result<OffsetDateTime> {
        instant.checked_add(self.0).ok_or_else(|| {
            CoreError::invalid_duration(format!("Offset {self} overflows from {instant}"))
        })
    }

    /// Build a duration from a FHIR quantity value and UCUM unit.
    pub fn from_quantity(value: f64, unit: &str) -> Result<Self> {
        let seconds_per_unit = match unit {
            "ms" => 0.001,
            "s" | "sec" | "second" | "seconds" => 1.0,
            "min" | "minute" | "minutes" => 60.0,
            "h" | "hour" | "hours" => 3_600.0,
            "d" | "day" | "days" => SECONDS_PER_DAY,
            "wk" | "week" | "weeks" => 7.0 * SECONDS_PER_DAY,
            "mo" | "month" | "months" => 30.0 * SECONDS_PER_DAY,
            "a" | "year" | "years" => 365.0 * SECONDS_PER_DAY,
            other => {
                return Err(CoreError::invalid_duration(format!(
                    "Unsupported duration unit: {other}"
                )));
            }
        };
        if !value.is_finite() {
            return Err(CoreError::invalid_duration(format!(
                "Duration value is not finite: {value}"
            )));
        }
        time::Duration::checked_seconds_f64(value * seconds_per_unit)
            .map(Self)
            .ok_or_else(|| {
                CoreError::invalid_duration(format!("Duration out of range: {value} {unit}"))
            })
    }

    /// Parse an ISO-8601 duration string.
    pub fn parse_iso(s: &str) -> Result<Self> {
        let caps = ISO_DURATION
            .captures(s.trim())
            .ok_or_else(|| CoreError::invalid_duration(format!("Unsupported duration format: {s}")))?;

        // Reject designator-only strings such as "P" or "PT".
        if (2..=8).all(|i| caps.get(i).is_none()) {
            return Err(CoreError::invalid_duration(format!(
                "Duration has no components: {s}"
            )));
        }

        let int = |i: usize| -> Result<i64> {
            caps.get(i)
                .map(|m| {
                    m.as_str()
                        .parse::<i64>()
                        .map_err(|e| CoreError::invalid_duration(format!("{s}: {e}")))
                })
                .unwrap_or(Ok(0))
        };

        let out_of_range = || CoreError::invalid_duration(format!("Duration out of range: {s}"));

        let days = [(2, 365), (3, 30), (4, 7), (5, 1)]
            .into_iter()
            .try_fold(0i64, |acc, (i, per)| {
                int(i)?
                    .checked_mul(per)
                    .and_then(|d| acc.checked_add(d))
                    .ok_or_else(out_of_range)
            })?;
        let seconds = caps
            .get(8)
            .map(|m| m.as_str().parse::<f64>())
            .transpose()
            .map_err(|e| CoreError::invalid_duration(format!("{s}: {e}")))?
            .unwrap_or(0.0);

        let (hours, minutes) = (int(6)?, int(7)?);
        let whole_seconds = days
            .checked_mul(86_400)
            .and_then(|d| d.checked_add(hours.checked_mul(3_600)?))
            .and_then(|d| d.checked_add(minutes.checked_mul(60)?))
            .ok_or_else(out_of_range)?;
        let duration = time::Duration::checked_seconds_f64(seconds)
            .and_then(|fraction| time::Duration::seconds(whole_seconds).checked_add(fraction))
            .ok_or_else(out_of_range)?;

        Ok(Self(if caps.get(1).is_some() { -duration } else { duration }))
    }
}

impl fmt::Display for FhirDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.whole_seconds();
        if secs < 0 {
            write!(f, "-PT{}S", secs.unsigned_abs())
        } else {
            write!(f, "PT{secs}S")
        }
    }
}

impl FromStr for FhirDuration {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_iso(s)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Iso(String),
    Quantity {
        value: f64,
        #[serde(default)]
        unit: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
}

impl Serialize for FhirDuration {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FhirDuration {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match DurationRepr::deserialize(deserializer)? {
            DurationRepr::Iso(s) => FhirDuration::parse_iso(&s).map_err(serde::de::Error::custom),
            DurationRepr::Quantity { value, unit, code } => {
                // UCUM code wins over the human-readable unit
                let unit = code.or(unit).unwrap_or_else(|| "s".to_string());
                FhirDuration::from_quantity(value, &unit).map_err(serde::de::Error::custom)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn test_fhir_datetime_display() {
        let fhir_dt = FhirDateTime::new(datetime!(2023-05-15 14:30:00 UTC));
        assert_eq!(fhir_dt.to_string(), "2023-05-15T14:30:00Z");
    }

    #[test]
    fn test_fhir_datetime_from_str_invalid() {
        assert!(FhirDateTime::from_str("invalid-date").is_err());
        assert!(FhirDateTime::from_str("2023-13-01T00:00:00Z").is_err());
        assert!(FhirDateTime::from_str("").is_err());
    }

    #[test]
    fn test_fhir_datetime_serde() {
        let fhir_dt = FhirDateTime::new(datetime!(2023-05-15 14:30:00 UTC));
        let json = serde_json::to_string(&fhir_dt).unwrap();
        assert_eq!(json, "\"2023-05-15T14:30:00Z\"");
        let back: FhirDateTime = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fhir_dt);
    }

    #[test]
    fn test_parse_iso_days_and_hours() {
        assert_eq!(
            FhirDuration::parse_iso("P1D").unwrap().as_duration(),
            time::Duration::days(1)
        );
        assert_eq!(
            FhirDuration::parse_iso("PT24H").unwrap().as_duration(),
            time::Duration::hours(24)
        );
        assert_eq!(
            FhirDuration::parse_iso("-PT30M").unwrap().as_duration(),
            time::Duration::minutes(-30)
        );
        assert_eq!(
            FhirDuration::parse_iso("P1DT2H").unwrap().as_duration(),
            time::Duration::hours(26)
        );
        assert_eq!(
            FhirDuration::parse_iso("P2W").unwrap().as_duration(),
            time::Duration::days(14)
        );
    }

    #[test]
    fn test_parse_iso_invalid() {
        assert!(FhirDuration::parse_iso("invalid").is_err());
        assert!(FhirDuration::parse_iso("PT").is_err());
        assert!(FhirDuration::parse_iso("P").is_err());
        assert!(FhirDuration::parse_iso("1D").is_err());
    }

    #[test]
    fn test_quantity_units() {
        assert_eq!(
            FhirDuration::from_quantity(2.0, "h").unwrap().as_duration(),
            time::Duration::hours(2)
        );
        assert_eq!(
            FhirDuration::from_quantity(1.0, "wk").unwrap().as_duration(),
            time::Duration::days(7)
        );
        assert!(FhirDuration::from_quantity(1.0, "fortnight").is_err());
    }

    #[test]
    fn test_deserialize_both_forms() {
        let iso: FhirDuration = serde_json::from_value(json!("P1D")).unwrap();
        let qty: FhirDuration =
            serde_json::from_value(json!({"value": 1, "unit": "day", "code": "d"})).unwrap();
        assert_eq!(iso, qty);

        let err = serde_json::from_value::<FhirDuration>(json!({"value": 3, "code": "eon"}));
        assert!(err.is_err());
    }

    #[test]
    fn test_after_resolves_fire_instant() {
        let base = datetime!(2024-01-01 00:00:00 UTC);
        let offset = FhirDuration::parse_iso("P1D").unwrap();
        assert_eq!(offset.after(base).unwrap(), datetime!(2024-01-02 00:00:00 UTC));
    }

    #[test]
    fn test_offset_beyond_calendar_range_is_an_error() {
        let base = datetime!(2024-01-01 00:00:00 UTC);
        let offset = FhirDuration::parse_iso("P20000Y").unwrap();
        let err = offset.after(base).unwrap_err();
        assert!(matches!(err, CoreError::InvalidDuration(_)));
    }

    #[test]
    fn test_oversized_components_are_rejected() {
        assert!(FhirDuration::from_quantity(1e300, "a").is_err());
        assert!(FhirDuration::from_quantity(f64::NAN, "s").is_err());
        assert!(FhirDuration::parse_iso("P9223372036854775807Y").is_err());
        assert!(FhirDuration::parse_iso("PT9223372036854775807H").is_err());
        assert!(serde_json::from_value::<FhirDuration>(json!({"value": 1e300, "unit": "a"})).is_err());
    }
}
