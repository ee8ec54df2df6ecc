//! Fibre Channel identifier helpers
//!
//! ESXi reports FC adapters as `fc.WWNN:WWPN` with bare hex; arrays want the
//! port name, usually uppercase and colon-separated.

use crate::error::{Error, Result};

/// Split an ESXi FC adapter id into `(WWNN, WWPN)`, uppercased
pub fn parse_fc_adapter_id(fc_id: &str) -> Result<(String, String)> {
    let invalid = |reason: String| Error::Configuration(format!("FC adapter id {:?} {}", fc_id, reason));

    let rest = fc_id
        .strip_prefix("fc.")
        .ok_or_else(|| invalid("doesn't start with 'fc.'".into()))?;
    let (wwnn, wwpn) = rest
        .split_once(':')
        .ok_or_else(|| invalid("is not in expected fc.WWNN:WWPN format".into()))?;

    if wwnn.is_empty() || wwpn.is_empty() {
        return Err(invalid("has an empty WWNN or WWPN".into()));
    }
    if wwpn.contains(':') {
        return Err(invalid("is not in expected fc.WWNN:WWPN format".into()));
    }
    for (label, part) in [("WWNN", wwnn), ("WWPN", wwpn)] {
        if part.len() % 2 != 0 {
            return Err(invalid(format!("has an odd-length {} {:?}", label, part)));
        }
        if !part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid(format!("has a non-hex {} {:?}", label, part)));
        }
    }

    Ok((wwnn.to_uppercase(), wwpn.to_uppercase()))
}

/// Insert a colon every two characters: `2100AB` -> `21:00:AB`
pub fn format_wwn(wwn: &str) -> String {
    wwn.as_bytes()
        .chunks(2)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Colon-separated uppercase WWPN of an `fc.WWNN:WWPN` adapter id
pub fn wwpn_from_adapter_id(fc_id: &str) -> Result<String> {
    parse_fc_adapter_id(fc_id).map(|(_, wwpn)| format_wwn(&wwpn))
}

/// Compare two WWNs ignoring case and separators
pub fn same_wwn(a: &str, b: &str) -> bool {
    let norm = |s: &str| {
        s.chars()
            .filter(|c| c.is_ascii_hexdigit())
            .collect::<String>()
            .to_uppercase()
    };
    norm(a) == norm(b)
}
