//! Duration strings as they appear in manifests and the parameters file.
//!
//! Accepts Go-style compound durations (`2s`, `1m30s`, `250ms`, `1h`) and the
//! keywords `infinity`/`infinite`, which disable a timeout.

use std::time::Duration;

/// A timeout value parsed from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Timeout {
    /// Not set; Envoy's own default applies.
    #[default]
    Default,
    /// Explicitly disabled.
    Disabled,
    /// Fires after the given duration.
    After(Duration),
}

impl Timeout {
    pub fn is_default(&self) -> bool {
        matches!(self, Timeout::Default)
    }

    /// Protobuf duration for Envoy; a disabled timeout is encoded as zero.
    pub fn to_proto(&self) -> Option<envoy_types::pb::google::protobuf::Duration> {
        match self {
            Timeout::Default => None,
            Timeout::Disabled => Some(envoy_types::pb::google::protobuf::Duration { seconds: 0, nanos: 0 }),
            Timeout::After(d) => Some(duration_to_proto(*d)),
        }
    }
}

/// Convert a std duration into the protobuf well-known type.
pub fn duration_to_proto(d: Duration) -> envoy_types::pb::google::protobuf::Duration {
    envoy_types::pb::google::protobuf::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

/// Parse a timeout. Empty input is [`Timeout::Default`].
pub fn parse_timeout(s: &str) -> Result<Timeout, String> {
    let s = s.trim();
    match s {
        "" => Ok(Timeout::Default),
        "infinity" | "infinite" => Ok(Timeout::Disabled),
        other => parse_duration(other).map(Timeout::After),
    }
}

/// Parse a compound duration such as `1h2m3s` or `1.5s`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("{s}: missing unit"))?;
        if number_end == 0 {
            return Err(format!("{s}: expected a number"));
        }
        let (number, tail) = rest.split_at(number_end);
        let unit_end = tail.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);

        let magnitude: f64 = number.parse().map_err(|e| format!("{s}: {e}"))?;
        let unit_secs = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => {
                return Err(format!(
                    "{s}: invalid unit {other:?} (expected one of 'ns', 'us', 'ms', 's', 'm', 'h')"
                ))
            }
        };
        total += Duration::from_secs_f64(magnitude * unit_secs);
        rest = next;
    }
    Ok(total)
}
