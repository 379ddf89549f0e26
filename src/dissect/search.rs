//! Reference search
//!
//! Queries over the cross-reference stores: referenced calls and data by
//! text pattern, and the referrers of a single address.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::store::CrossReferenceStores;
use crate::analysis::loader::SymbolTable;
use crate::core::memory::AddressSpace;
use crate::core::value::ValueType;

/// Regex or plain substring matcher
#[derive(Debug, Clone)]
pub enum TextMatcher {
    Regex(Regex),
    Substring(String),
}

impl TextMatcher {
    /// Compile a matcher; fails only for an invalid regex.
    /// Case-insensitive substrings become an escaped regex so both sides
    /// are compared with simple case folding.
    pub fn new(pattern: &str, case_sensitive: bool, regex: bool) -> Result<Self, regex::Error> {
        if case_sensitive && !regex {
            return Ok(TextMatcher::Substring(pattern.to_string()));
        }
        let source = if regex {
            pattern.to_string()
        } else {
            regex::escape(pattern)
        };
        let compiled = RegexBuilder::new(&source)
            .case_insensitive(!case_sensitive)
            .build()?;
        Ok(TextMatcher::Regex(compiled))
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            TextMatcher::Regex(regex) => regex.is_match(text),
            TextMatcher::Substring(needle) => text.contains(needle.as_str()),
        }
    }
}

/// A referenced call target and how many call sites reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencedCall {
    pub target: u64,
    /// `0x401000 <puts@plt>`
    pub symbol: String,
    pub referrers: usize,
}

/// A referenced data address with its decoded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencedString {
    pub address: u64,
    pub referrers: usize,
    /// `None` when the address is no longer readable
    pub value: Option<String>,
}

/// Everything that references one address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referrers {
    /// (symbolized origin, mnemonic)
    pub jumps: Vec<(String, String)>,
    /// Symbolized origins
    pub calls: Vec<String>,
}

/// Call targets whose symbolized rendering matches
pub fn search_referenced_calls(
    stores: &CrossReferenceStores,
    symbols: &SymbolTable,
    matcher: &TextMatcher,
) -> Vec<ReferencedCall> {
    stores
        .calls
        .iter()
        .filter_map(|(target, origins)| {
            let symbol = symbols.describe(*target);
            matcher.is_match(&symbol).then(|| ReferencedCall {
                target: *target,
                symbol,
                referrers: origins.len(),
            })
        })
        .collect()
}

/// Referenced data whose value, read as `value_type`, matches.
/// An empty pattern lists everything.
pub fn search_referenced_strings(
    stores: &CrossReferenceStores,
    memory: &dyn AddressSpace,
    matcher: &TextMatcher,
    value_type: ValueType,
) -> Vec<ReferencedString> {
    stores
        .strings
        .iter()
        .filter_map(|(address, origins)| {
            let value = value_type.read(memory, *address);
            let text = value.as_deref().unwrap_or("");
            matcher.is_match(text).then(|| ReferencedString {
                address: *address,
                referrers: origins.len(),
                value,
            })
        })
        .collect()
}

/// Jumps and calls referencing `address`
pub fn referrers(stores: &CrossReferenceStores, symbols: &SymbolTable, address: u64) -> Referrers {
    let jumps = stores
        .jumps
        .get(&address)
        .map(|origins| {
            origins
                .iter()
                .map(|(origin, mnemonic)| (symbols.describe(*origin), mnemonic.clone()))
                .collect()
        })
        .unwrap_or_default();
    let calls = stores
        .calls
        .get(&address)
        .map(|origins| origins.iter().map(|origin| symbols.describe(*origin)).collect())
        .unwrap_or_default();
    Referrers { jumps, calls }
}
