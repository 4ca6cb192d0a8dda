//! Site code extraction from free-text alarm source fields
//!
//! Alarm sources describe the affected network element in several shapes:
//!
//! ```text
//! RUR6499__S_KhankeMod
//! LTE_LHR9147__S_RajputPark
//! LTE_RUR6614_S_HardosohalMuslimRd
//! eNodeB Function Name=LTE_HWY0993__P_KudaltiMor, Local Cell ID=51, Cell Name=L1HWY09931A
//! Cell Name=L1FRQ59402A
//! ```
//!
//! The site code is always three letters followed by four digits.

use regex::Regex;
use std::sync::LazyLock;

static ENODEB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)eNodeB\s*Function\s*Name\s*=\s*(?:LTE_)?([A-Z]{3}\d{4})")
        .expect("Invalid eNodeB regex")
});

static CELL_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Cell\s*Name\s*=\s*L\d([A-Z]{3}\d{4})\d[A-Z]").expect("Invalid cell name regex")
});

static CELL_INFO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Cell\s*Name\s*=\s*(\w+)").expect("Invalid cell info regex"));

static SITE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:LTE_)?([A-Z]{3}\d{4})(?:__|_)[SHPT]_[\w\s\-]+")
        .expect("Invalid site name regex")
});

static BARE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:LTE_)?([A-Z]{3}\d{4})").expect("Invalid site code regex"));

static VALID_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{3}\d{4}$").expect("Invalid site code regex"));

static LOCAL_CELL_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*,\s*Local\s*Cell.*$").expect("Invalid suffix regex"));

static CELL_FDD_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*,\s*Cell\s*FDD.*$").expect("Invalid suffix regex"));

/// Site details pulled out of an alarm source string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteInfo {
    /// e.g. `LHR9147`
    pub site_code: String,
    /// e.g. `LHR9147__S_RajputPark`, or the bare code when no name is present
    pub full_name: String,
    /// Cell name for sector-level alarms, e.g. `L1FRQ59402A`
    pub cell_info: Option<String>,
}

/// Extract the site referenced by an alarm source string.
///
/// Matchers are tried in priority order: eNodeB key/value strings, cell
/// names, underscore-delimited site names, then any bare code.
pub fn extract(source: &str) -> Option<SiteInfo> {
    let source = source.trim();
    if source.is_empty() {
        return None;
    }

    if let Some(caps) = ENODEB_RE.captures(source) {
        return build(&caps[1], source, None);
    }

    if let Some(caps) = CELL_NAME_RE.captures(source) {
        let cell_info = CELL_INFO_RE
            .captures(source)
            .map(|c| c[1].to_string());
        return build(&caps[1], source, cell_info);
    }

    for re in [&*SITE_NAME_RE, &*BARE_CODE_RE] {
        if let Some(caps) = re.captures(source) {
            return build(&caps[1], source, None);
        }
    }

    None
}

/// Normalize a directory key such as `lte_lhr9147__S_x` to `LHR9147`.
pub fn normalize(code: &str) -> Option<String> {
    let code = code.trim().to_uppercase();
    let code = code.strip_prefix("LTE_").unwrap_or(&code);
    let candidate = code.get(..7)?;
    VALID_CODE_RE
        .is_match(candidate)
        .then(|| candidate.to_string())
}

fn build(raw_code: &str, source: &str, cell_info: Option<String>) -> Option<SiteInfo> {
    let site_code = raw_code.to_uppercase();
    if !VALID_CODE_RE.is_match(&site_code) {
        return None;
    }
    let full_name = full_name(source, &site_code);
    Some(SiteInfo {
        site_code,
        full_name,
        cell_info,
    })
}

fn full_name(source: &str, site_code: &str) -> String {
    let pattern = format!(
        r"(?i)(?:LTE_)?({}(?:__|_)[SHPT]_[\w\s\-]+)",
        regex::escape(site_code)
    );
    let Ok(re) = Regex::new(&pattern) else {
        return site_code.to_string();
    };

    match re.captures(source) {
        Some(caps) => {
            let name = LOCAL_CELL_SUFFIX_RE.replace(&caps[1], "");
            let name = CELL_FDD_SUFFIX_RE.replace(&name, "");
            name.trim().to_string()
        }
        None => site_code.to_string(),
    }
}
