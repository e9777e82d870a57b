//! GFWList rule parsing and matching.
//!
//! Grounded on `examples/original_source/client/gfwlist.go`: same four rule
//! forms, same whitelist-precedence `Match`/`MatchAddr` semantics, same
//! `*`-only glob and fuzzy address-only truncation, same domain export. The
//! mutable-in-place `GFWList` of the original is replaced with an immutable
//! value swapped atomically on `update` (see `SPEC_FULL.md` §5) via
//! `arc_swap::ArcSwap`.

use std::sync::Arc;

use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;

use crate::error::Error;

#[derive(Debug, Clone, Default)]
pub struct GfwList {
    pub blacklist: Vec<String>,
    pub whitelist: Vec<String>,
}

impl GfwList {
    pub fn new() -> Self {
        GfwList { blacklist: Vec::with_capacity(6000), whitelist: Vec::with_capacity(500) }
    }

    /// Decodes a base64-encoded rule list and appends its rules. `clear`
    /// replaces any existing rules rather than appending.
    pub fn extract(text: &[u8], clear: bool) -> Result<GfwList, Error> {
        let decoded = BASE64
            .decode(strip_base64_whitespace(text))
            .map_err(|e| Error::GfwList(format!("invalid base64: {e}")))?;
        let decoded = String::from_utf8_lossy(&decoded);

        let mut list = if clear { GfwList::new() } else { GfwList::default() };
        for line in decoded.lines() {
            let rule = line.split('!').next().unwrap_or("");
            if rule.is_empty() || rule.starts_with('[') {
                continue;
            }
            if let Some(stripped) = rule.strip_prefix("@@") {
                list.whitelist.push(stripped.to_string());
            } else {
                list.blacklist.push(rule.to_string());
            }
        }
        Ok(list)
    }

    /// Matches a full URL string (scheme://host[:port]/path...) against the
    /// list with user-info and port stripped from the host first.
    pub fn matches_url(&self, scheme: &str, host: &str, path: &str) -> bool {
        let stripped = format!("{scheme}://{host}{path}");
        for rule in &self.whitelist {
            if match_rule(host, &stripped, rule) {
                return false;
            }
        }
        for rule in &self.blacklist {
            if match_rule(host, &stripped, rule) {
                return true;
            }
        }
        false
    }

    /// Address-only match: synthesizes `http://host/` or `https://host/` and
    /// matches against it, truncating blacklist path components in "fuzzy"
    /// mode since they can't be known from address-only data.
    pub fn match_addr(&self, host: &str, port: &str) -> bool {
        let scheme = if port == "443" || port == "https" { "https" } else { "http" };
        let url = format!("{scheme}://{host}/");
        for rule in &self.whitelist {
            if match_rule_addr(host, &url, rule, false) {
                return false;
            }
        }
        for rule in &self.blacklist {
            if match_rule_addr(host, &url, rule, true) {
                return true;
            }
        }
        false
    }

    /// Derives deduplicated bare-domain lists (blacklist, whitelist) for
    /// dnsmasq export, dropping regex and wildcard-bearing rules.
    pub fn export_domains(&self) -> (Vec<String>, Vec<String>) {
        (export_one(&self.blacklist), export_one(&self.whitelist))
    }
}

/// Process-wide current rule set; a failed `update` leaves the prior value
/// in place (the `update` caller simply does not call `store`).
pub struct GfwListStore {
    current: ArcSwap<GfwList>,
}

impl GfwListStore {
    pub fn new(initial: GfwList) -> Self {
        GfwListStore { current: ArcSwap::from_pointee(initial) }
    }

    pub fn load(&self) -> Arc<GfwList> {
        self.current.load_full()
    }

    pub fn store(&self, list: GfwList) {
        self.current.store(Arc::new(list));
    }
}

fn strip_base64_whitespace(text: &[u8]) -> Vec<u8> {
    text.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect()
}

fn match_rule(host: &str, stripped_url: &str, rule: &str) -> bool {
    if let Some(domain) = rule.strip_prefix("||") {
        return glob(host, domain) || glob(host, &format!("*.{domain}"));
    }
    if let Some(prefix) = rule.strip_prefix('|') {
        return glob(stripped_url, &format!("{prefix}*"));
    }
    if rule.len() >= 2 && rule.starts_with('/') && rule.ends_with('/') {
        return Regex::new(&rule[1..rule.len() - 1])
            .map(|re| re.is_match(stripped_url))
            .unwrap_or(false);
    }
    glob(stripped_url, &format!("*{rule}*"))
}

fn match_rule_addr(host: &str, url: &str, rule: &str, fuzzy: bool) -> bool {
    if let Some(domain) = rule.strip_prefix("||") {
        return glob(host, domain) || glob(host, &format!("*.{domain}"));
    }
    if let Some(prefix) = rule.strip_prefix('|') {
        let prefix = if fuzzy { truncate_after_scheme(prefix) } else { prefix.to_string() };
        return glob(url, &format!("{prefix}*"));
    }
    if rule.len() >= 2 && rule.starts_with('/') && rule.ends_with('/') {
        return Regex::new(&rule[1..rule.len() - 1]).map(|re| re.is_match(url)).unwrap_or(false);
    }
    let rule = if fuzzy { truncate_after_scheme(rule) } else { rule.to_string() };
    glob(url, &format!("*{rule}*"))
}

/// Truncates `rule` at the first `/` after a `://`, discarding path
/// components that can't be known from address-only data.
fn truncate_after_scheme(rule: &str) -> String {
    let scheme_end = rule.find("://").map(|i| i + 3).unwrap_or(0);
    match rule[scheme_end..].find('/') {
        Some(off) => rule[..scheme_end + off].to_string(),
        None => rule.to_string(),
    }
}

/// `*`-only glob: no `*` means exact equality; otherwise prefix/middle/suffix
/// match against successive segments split by `*`.
fn glob(s: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() < 2 {
        return s == pattern;
    }
    let Some(mut rest) = s.strip_prefix(parts[0]) else { return false };
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(parts[parts.len() - 1])
}

fn export_one(rules: &[String]) -> Vec<String> {
    let domain_re = Regex::new(r"^(\.?([^/:@*.]+\.)+[^/:@*.]+)/?$").unwrap();
    let fuzzy_domain_re = Regex::new(r"([^/:@*.]+\.)+[^/:@*.]+").unwrap();

    let mut out = Vec::with_capacity(rules.len());
    let mut last = String::new();
    for rule in rules {
        if let Some(domain) = rule.strip_prefix("||") {
            if !domain.contains('*') && domain != last {
                out.push(domain.to_string());
                last = domain.to_string();
            }
            continue;
        }
        if rule.len() >= 2 && rule.starts_with('/') && rule.ends_with('/') {
            continue;
        }
        let rule_body = rule.strip_prefix('|').unwrap_or(rule);
        if let Some(m) = domain_re.captures(rule_body).and_then(|c| c.get(1)) {
            if m.as_str() != last {
                out.push(m.as_str().to_string());
                last = m.as_str().to_string();
            }
            continue;
        }
        if let Some(m) = fuzzy_domain_re.find(rule_body) {
            if m.as_str() != last {
                out.push(m.as_str().to_string());
                last = m.as_str().to_string();
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_rules(lines: &[&str]) -> Vec<u8> {
        BASE64.encode(lines.join("\n")).into_bytes()
    }

    #[test]
    fn whitelist_wins() {
        let raw = encode_rules(&["||example.com", "@@||api.example.com"]);
        let list = GfwList::extract(&raw, true).unwrap();
        assert!(!list.matches_url("https", "api.example.com", "/"));
        assert!(list.matches_url("https", "www.example.com", "/"));
    }

    #[test]
    fn comment_and_section_lines_skipped() {
        let raw = encode_rules(&["[AutoProxy]", "! comment", "||example.com"]);
        let list = GfwList::extract(&raw, true).unwrap();
        assert_eq!(list.blacklist, vec!["||example.com"]);
    }

    #[test]
    fn prefix_rule() {
        let raw = encode_rules(&["|http://bad.test/"]);
        let list = GfwList::extract(&raw, true).unwrap();
        assert!(list.matches_url("http", "bad.test", "/anything"));
    }

    #[test]
    fn regex_rule_never_errors_just_nonmatches() {
        let raw = encode_rules(&["/(unterminated/"]);
        let list = GfwList::extract(&raw, true).unwrap();
        assert!(!list.matches_url("http", "example.com", "/"));
    }

    #[test]
    fn keyword_rule() {
        let raw = encode_rules(&["blocked-keyword"]);
        let list = GfwList::extract(&raw, true).unwrap();
        assert!(list.matches_url("http", "example.com", "/blocked-keyword/x"));
    }

    #[test]
    fn match_addr_fuzzy_truncates_path() {
        let raw = encode_rules(&["|http://example.com/specific/path"]);
        let list = GfwList::extract(&raw, true).unwrap();
        assert!(list.match_addr("example.com", "80"));
    }

    #[test]
    fn glob_matches_middle_segments() {
        assert!(glob("foo-middle-bar", "foo*bar"));
        assert!(!glob("foo-bar", "foo*baz"));
        assert!(glob("exact", "exact"));
    }

    #[test]
    fn export_domains_dedupes_and_skips_wildcards_and_regex() {
        let raw = encode_rules(&["||a.com", "||a.com", "/re/", "||b.*"]);
        let list = GfwList::extract(&raw, true).unwrap();
        let (black, _white) = list.export_domains();
        assert_eq!(black, vec!["a.com"]);
    }

    #[test]
    fn store_keeps_prior_on_failed_update() {
        let store = GfwListStore::new(GfwList::new());
        assert!(store.load().blacklist.is_empty());
        let mut replacement = GfwList::new();
        replacement.blacklist.push("||example.com".to_string());
        store.store(replacement);
        assert_eq!(store.load().blacklist.len(), 1);
    }
}
