use std::time::Duration;

use anyhow::{bail, Result};

/// Parses a human retention age like `30s`, `90m`, `1h30m` or `7d` into a
/// `Duration`. Units are seconds/minutes/hours/days/weeks; a bare trailing
/// number counts as seconds.
pub fn parse_age(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }

    let mut total_secs = 0u64;
    let mut value: Option<u64> = None;
    for c in s.chars() {
        match c {
            '0'..='9' => {
                let digit = (c as u8 - b'0') as u64;
                value = Some(value.unwrap_or(0) * 10 + digit);
            }
            unit => {
                let Some(v) = value.take() else {
                    bail!("unexpected '{unit}' in duration '{s}'");
                };
                let mult = match unit.to_ascii_lowercase() {
                    's' => 1,
                    'm' => 60,
                    'h' => 3600,
                    'd' => 86_400,
                    'w' => 7 * 86_400,
                    _ => bail!("unknown duration unit '{unit}' in '{s}'"),
                };
                total_secs += v * mult;
            }
        }
    }
    // trailing bare number, e.g. "90" or the "30" in "1m30"
    if let Some(v) = value {
        total_secs += v;
    }

    Ok(Duration::from_secs(total_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_units() {
        assert_eq!(parse_age("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_age("30m").unwrap(), Duration::from_secs(30 * 60));
        assert_eq!(parse_age("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_age("7d").unwrap(), Duration::from_secs(7 * 86_400));
        assert_eq!(parse_age("2w").unwrap(), Duration::from_secs(14 * 86_400));
    }

    #[test]
    fn test_compound() {
        assert_eq!(parse_age("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_age("1m30").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn test_bare_seconds() {
        assert_eq!(parse_age("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_age("").is_err());
        assert!(parse_age("h").is_err());
        assert!(parse_age("10x").is_err());
    }
}
