//! Decoding of the self-report a hub streams back after a discovery announce.
//!
//! Hubs answer the announce by opening a TCP connection and writing one
//! report in their native `key:value;key:value` form, e.g.
//!
//! ```text
//! friendlyName:Living Room;ip:192.168.1.20;uuid:7d3c...;discoveryServerUri:https://svcs.example/x
//! ```
//!
//! Only the first `:` of each field separates key from value, so URIs survive.
//! Text already in the wire-codec form (`key=value:key=value`) is accepted too.

use super::codec::{self, decode_brace_group, ProtocolError, WireMap, WireValue};

/// Decodes a complete self-report buffer.
///
/// # Errors
///
/// Returns [`ProtocolError::Empty`] for a blank buffer and
/// [`ProtocolError::Malformed`] when no field could be extracted.
///
/// # Examples
///
/// ```rust
/// use harmony_core::protocol::report::decode_report;
///
/// let report = decode_report("hello:world;goodbye:earth").unwrap();
/// assert_eq!(report["hello"].as_str(), Some("world"));
/// assert_eq!(report["goodbye"].as_str(), Some("earth"));
/// ```
pub fn decode_report(text: &str) -> Result<WireMap, ProtocolError> {
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if text.is_empty() {
        return Err(ProtocolError::Empty);
    }

    if is_native_form(text) {
        decode_native(text)
    } else {
        codec::try_decode(text)
    }
}

fn is_native_form(text: &str) -> bool {
    text.contains(';') || !text.contains('=')
}

fn decode_native(text: &str) -> Result<WireMap, ProtocolError> {
    let mut map = WireMap::new();
    for field in text.split(';') {
        let Some((key, value)) = field.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        map.insert(key.to_string(), native_value(value.trim()));
    }

    if map.is_empty() {
        return Err(ProtocolError::Malformed(
            "self-report has no key:value fields".to_string(),
        ));
    }
    Ok(map)
}

fn native_value(value: &str) -> WireValue {
    if value.starts_with('{') && value.ends_with('}') {
        if let Ok(group) = decode_brace_group(value) {
            return WireValue::Map(group);
        }
    }
    WireValue::Text(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_report_native_form() {
        // Arrange
        let raw = "friendlyName:Living Room;ip:192.168.1.20;uuid:abc-123;port:5222";

        // Act
        let report = decode_report(raw).unwrap();

        // Assert
        assert_eq!(report["friendlyName"].as_str(), Some("Living Room"));
        assert_eq!(report["ip"].as_str(), Some("192.168.1.20"));
        assert_eq!(report["uuid"].as_str(), Some("abc-123"));
        assert_eq!(report["port"].as_str(), Some("5222"));
    }

    #[test]
    fn test_decode_report_keeps_colons_after_first() {
        let report = decode_report("discoveryServerUri:https://svcs.example:443/x;ip:10.0.0.2").unwrap();
        assert_eq!(
            report["discoveryServerUri"].as_str(),
            Some("https://svcs.example:443/x")
        );
    }

    #[test]
    fn test_decode_report_brace_value_becomes_mapping() {
        let report =
            decode_report(r#"hubProfiles:{Harmony="2.0", IFTTT="1.0"};uuid:u1"#).unwrap();
        let profiles = report["hubProfiles"].as_map().unwrap();
        assert_eq!(profiles["Harmony"].as_str(), Some("2.0"));
        assert_eq!(profiles["IFTTT"].as_str(), Some("1.0"));
    }

    #[test]
    fn test_decode_report_single_field_without_semicolon() {
        let report = decode_report("hello:world").unwrap();
        assert_eq!(report["hello"].as_str(), Some("world"));
    }

    #[test]
    fn test_decode_report_accepts_wire_form() {
        let report = decode_report("hello=world:goodbye=earth").unwrap();
        assert_eq!(report["hello"].as_str(), Some("world"));
        assert_eq!(report["goodbye"].as_str(), Some("earth"));
    }

    #[test]
    fn test_decode_report_trims_trailing_newline_and_nul() {
        let report = decode_report("uuid:u1;ip:10.0.0.9\n\0").unwrap();
        assert_eq!(report["ip"].as_str(), Some("10.0.0.9"));
    }

    #[test]
    fn test_decode_report_empty_is_error() {
        assert_eq!(decode_report("  \n"), Err(ProtocolError::Empty));
    }

    #[test]
    fn test_decode_report_garbage_is_malformed() {
        assert!(matches!(
            decode_report(";;;"),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
