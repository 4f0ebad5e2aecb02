//! CVE identifier normalization.
//!
//! Every source spells CVE identifiers differently: mixed separators,
//! inconsistent case, missing zero padding. All cross-source comparison in the
//! synchronizer happens on the canonical `CVE-YYYY-NNNN` form produced here.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{Record, get_str};

/// Matches `CVE`, an optional separator, a four digit year, another optional
/// separator and a 1-7 digit sequence number anywhere in free-form text.
static CVE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bCVE[-_\s]?(\d{4})[-_\s]?(\d{1,7})\b").expect("CVE regex is valid")
});

/// Field names under which sources commonly carry their join key, tried after
/// the per-source configured names.
pub const JOIN_KEY_FALLBACKS: &[&str] = &["cve_id", "CVE", "cve", "cveID"];

/// A normalized CVE identifier in the canonical `CVE-YYYY-NNNN` form.
///
/// Can only be produced through [`normalize_cve`] or [`extract_cves`], so a
/// value of this type is always comparable across sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CveId(String);

impl CveId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalizes a free-form identifier string into the canonical CVE form.
///
/// Extracts the first CVE-shaped pattern and returns it as `CVE-YYYY-NNNN` with
/// the sequence left-padded to at least four digits. Malformed or empty input
/// yields `None`; this function never panics.
pub fn normalize_cve(raw: &str) -> Option<CveId> {
    let captures = CVE_REGEX.captures(raw)?;

    let year = &captures[1];
    let sequence = format!("{:0>4}", &captures[2]);

    Some(CveId(format!("CVE-{year}-{sequence}")))
}

/// Extracts every CVE identifier embedded in a blob of mixed text.
///
/// Returns a deduplicated list preserving first-occurrence order. Useful for
/// description columns that mention several identifiers.
pub fn extract_cves(text: &str) -> Vec<CveId> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for captures in CVE_REGEX.captures_iter(text) {
        let year = &captures[1];
        let sequence = format!("{:0>4}", &captures[2]);
        let id = CveId(format!("CVE-{year}-{sequence}"));

        if seen.insert(id.clone()) {
            out.push(id);
        }
    }

    out
}

/// Resolves a record's join key by trying the configured field names first and
/// the common fallbacks second, normalizing the first textual value found.
pub fn resolve_join_key(record: &Record, preferred_fields: &[String]) -> Option<CveId> {
    let preferred = preferred_fields.iter().map(String::as_str);
    let fallbacks = JOIN_KEY_FALLBACKS.iter().copied();

    for field in preferred.chain(fallbacks) {
        if let Some(raw) = get_str(record, field)
            && let Some(id) = normalize_cve(raw)
        {
            return Some(id);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_separator_and_padding_variants() {
        let expected = "CVE-2021-0001";

        assert_eq!(normalize_cve("CVE-2021-1").unwrap().as_str(), expected);
        assert_eq!(normalize_cve("cve_2021_0001").unwrap().as_str(), expected);
        assert_eq!(normalize_cve("CVE 2021 1").unwrap().as_str(), expected);
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_cve("cve-2017-143").unwrap();
        let twice = normalize_cve(once.as_str()).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn long_sequences_are_not_padded_further() {
        assert_eq!(
            normalize_cve("CVE-2023-1234567").unwrap().as_str(),
            "CVE-2023-1234567"
        );
    }

    #[test]
    fn malformed_input_is_absent() {
        assert!(normalize_cve("").is_none());
        assert!(normalize_cve("not a cve").is_none());
        assert!(normalize_cve("CVE-").is_none());
        assert!(normalize_cve("CVE-20-1").is_none());
    }

    #[test]
    fn extracts_all_identifiers_in_order_without_duplicates() {
        let text = "exploits CVE-2021-44228 and cve_2017_0143, see also CVE-2021-44228";
        let ids = extract_cves(text);

        let rendered: Vec<_> = ids.iter().map(CveId::as_str).collect();
        assert_eq!(rendered, vec!["CVE-2021-44228", "CVE-2017-0143"]);
    }

    #[test]
    fn join_key_resolution_prefers_configured_fields() {
        let mut record = Record::new();
        record.insert("vuln_ref".into(), json!("CVE-2020-5"));
        record.insert("cve_id".into(), json!("CVE-2019-9"));

        let preferred = vec!["vuln_ref".to_string()];
        let id = resolve_join_key(&record, &preferred).unwrap();
        assert_eq!(id.as_str(), "CVE-2020-0005");

        let id = resolve_join_key(&record, &[]).unwrap();
        assert_eq!(id.as_str(), "CVE-2019-0009");
    }

    #[test]
    fn join_key_resolution_handles_missing_key() {
        let mut record = Record::new();
        record.insert("title".into(), json!("no identifier here"));

        assert!(resolve_join_key(&record, &[]).is_none());
    }
}
