//! Firmware version parsing and the compatibility gate.
use std::cmp::Ordering;

/// Version used for builds we cannot parse; always treated as supported.
pub const UNKNOWN_VERSION: &str = "0.0.0";
/// First firmware that publishes to the encrypted `/2/e/` MQTT topic.
pub const ENCRYPTED_MQTT_MIN_VERSION: &str = "2.3.2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub version: String,
    /// False when the raw string had no `.` at all.
    pub valid: bool,
}

/// Reduce a reported firmware string to `major.minor.patch`.
///
/// `2.3.10-abcdef` and `2.3.10.abcdef` both become `2.3.10`; a string with
/// no `.` is invalid and maps to `0.0.0`.
pub fn parse_version(raw: &str) -> FirmwareVersion {
    let raw = raw.trim();
    if !raw.contains('.') {
        return FirmwareVersion {
            version: UNKNOWN_VERSION.to_string(),
            valid: false,
        };
    }
    let base = raw.split('-').next().unwrap_or(raw);
    let mut parts: Vec<&str> = base.split('.').collect();
    if parts.len() > 3 {
        parts.truncate(3);
    } else if parts.len() > 1 {
        let last_is_numeric = parts
            .last()
            .map(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false);
        if !last_is_numeric {
            parts.pop();
        }
    }
    FirmwareVersion {
        version: parts.join("."),
        valid: true,
    }
}

/// Numeric comparison of dotted versions; missing or non-numeric parts count as 0.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|p| {
                p.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (pa, pb) = (parse(a), parse(b));
    for i in 0..pa.len().max(pb.len()) {
        let x = pa.get(i).copied().unwrap_or(0);
        let y = pb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

pub fn is_supported(version: &str, minimum: &str) -> bool {
    version == UNKNOWN_VERSION || compare_versions(version, minimum) != Ordering::Less
}

pub fn uses_encrypted_mqtt_topic(version: &str) -> bool {
    compare_versions(version, ENCRYPTED_MQTT_MIN_VERSION) != Ordering::Less
}

/// Text shown while an unsupported firmware is connected.
pub fn upgrade_required_message(minimum: &str) -> String {
    format!(
        "🚨 Update your firmware: this app requires Meshtastic firmware {} or newer.",
        minimum
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_build_hash_suffixes() {
        assert_eq!(parse_version("2.3.10-abcdef").version, "2.3.10");
        assert_eq!(parse_version("2.3.10.abcdef").version, "2.3.10");
        assert_eq!(parse_version("2.5.6.d55c08d").version, "2.5.6");
        assert_eq!(parse_version("2.3.10").version, "2.3.10");
        assert!(parse_version("2.3.10-abcdef").valid);
    }

    #[test]
    fn hash_only_string_is_invalid() {
        let v = parse_version("abcdef1");
        assert!(!v.valid);
        assert_eq!(v.version, "0.0.0");
    }

    #[test]
    fn numeric_ordering_not_lexical() {
        assert_eq!(compare_versions("2.3.10", "2.3.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.0", "2.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.3.48", "2.0.0"), Ordering::Less);
    }

    #[test]
    fn gate_accepts_unknown_and_newer() {
        assert!(is_supported("0.0.0", "2.0.0"));
        assert!(is_supported("0.0.0", "99.0.0"));
        assert!(is_supported("2.0.0", "2.0.0"));
        assert!(!is_supported("1.3.48", "2.0.0"));
        assert!(uses_encrypted_mqtt_topic("2.3.2"));
        assert!(!uses_encrypted_mqtt_topic("2.3.1"));
    }
}
