//! Variant option parsing.
//!
//! Variant titles like `"V6 / 0.4mm"` or `"Red / Large"` are turned into
//! key/value option pairs by an ordered list of rules. The first rule that
//! accepts a title wins; [`OptionRule::Fallback`] always accepts.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use catalogsync_shared::OptionsConfig;

/// Numeric measurements such as `0.4mm`, `1.75 mm`, `500g`, `12"`.
static MEASUREMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^\d+(?:[.,]\d+)?\s*(?:mm|cm|m|in|inch|"|g|kg|ml|l|oz|lb)$"#)
        .expect("valid regex")
});

const DEFAULT_TITLE: &str = "default title";

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// One matcher in the rule list.
#[derive(Debug, Clone)]
pub enum OptionRule {
    /// `"Default Title"` carries no options.
    DefaultTitle,
    /// Two slash parts on a product whose type contains `product_type_contains`.
    SlashPair {
        product_type_contains: String,
        keys: [String; 2],
    },
    /// Every slash part is a known color or size, each bucket used once.
    KeywordBucket {
        colors: HashSet<String>,
        sizes: HashSet<String>,
    },
    /// Any two slash parts become `Type` / `Size`.
    GenericSlash,
    /// The whole title becomes `Variant`.
    Fallback,
}

impl OptionRule {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DefaultTitle => "default-title",
            Self::SlashPair { .. } => "slash-pair",
            Self::KeywordBucket { .. } => "keyword-bucket",
            Self::GenericSlash => "generic-slash",
            Self::Fallback => "fallback",
        }
    }

    /// Try this rule. `None` means the next rule should be tried.
    pub fn apply(&self, title: &str, product_type: &str) -> Option<BTreeMap<String, String>> {
        let title = title.trim();
        match self {
            Self::DefaultTitle => title
                .eq_ignore_ascii_case(DEFAULT_TITLE)
                .then(BTreeMap::new),

            Self::SlashPair {
                product_type_contains,
                keys,
            } => {
                if !product_type
                    .to_lowercase()
                    .contains(&product_type_contains.to_lowercase())
                {
                    return None;
                }
                let parts = slash_parts(title);
                let [left, right] = parts.as_slice() else {
                    return None;
                };
                Some(BTreeMap::from([
                    (keys[0].clone(), left.to_string()),
                    (keys[1].clone(), right.to_string()),
                ]))
            }

            Self::KeywordBucket { colors, sizes } => {
                let parts = slash_parts(title);
                if parts.is_empty() || parts.len() > 2 {
                    return None;
                }
                let mut options = BTreeMap::new();
                for part in parts {
                    let lower = part.to_lowercase();
                    let key = if colors.contains(&lower) {
                        "Color"
                    } else if sizes.contains(&lower) || MEASUREMENT_RE.is_match(part) {
                        "Size"
                    } else {
                        return None;
                    };
                    if options.insert(key.to_string(), part.to_string()).is_some() {
                        return None;
                    }
                }
                Some(options)
            }

            Self::GenericSlash => {
                let parts = slash_parts(title);
                let [left, right] = parts.as_slice() else {
                    return None;
                };
                Some(BTreeMap::from([
                    ("Type".to_string(), left.to_string()),
                    ("Size".to_string(), right.to_string()),
                ]))
            }

            Self::Fallback => {
                if title.is_empty() {
                    Some(BTreeMap::new())
                } else {
                    Some(BTreeMap::from([("Variant".to_string(), title.to_string())]))
                }
            }
        }
    }
}

/// Non-empty trimmed parts of a slash-separated title.
fn slash_parts(title: &str) -> Vec<&str> {
    if !title.contains('/') {
        return if title.is_empty() { vec![] } else { vec![title] };
    }
    let parts: Vec<&str> = title.split('/').map(str::trim).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return vec![];
    }
    parts
}

// ---------------------------------------------------------------------------
// Rule list
// ---------------------------------------------------------------------------

/// Ordered rule list. Always ends with [`OptionRule::Fallback`].
#[derive(Debug, Clone)]
pub struct OptionRules {
    rules: Vec<OptionRule>,
}

impl OptionRules {
    /// Configured slash pairs first, then the built-ins.
    pub fn from_config(config: &OptionsConfig) -> Self {
        let mut rules = vec![OptionRule::DefaultTitle];

        rules.extend(config.slash_pairs.iter().map(|p| OptionRule::SlashPair {
            product_type_contains: p.product_type_contains.clone(),
            keys: p.keys.clone(),
        }));

        rules.push(OptionRule::SlashPair {
            product_type_contains: "nozzle".into(),
            keys: ["Nozzle Type".into(), "Nozzle Size".into()],
        });
        rules.push(OptionRule::KeywordBucket {
            colors: config.colors.iter().map(|c| c.to_lowercase()).collect(),
            sizes: config.sizes.iter().map(|s| s.to_lowercase()).collect(),
        });
        rules.push(OptionRule::GenericSlash);
        rules.push(OptionRule::Fallback);

        Self { rules }
    }

    pub fn rules(&self) -> &[OptionRule] {
        &self.rules
    }

    /// Parse a variant title into option pairs.
    pub fn parse(&self, title: &str, product_type: &str) -> BTreeMap<String, String> {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(title, product_type))
            .unwrap_or_default()
    }
}

impl Default for OptionRules {
    fn default() -> Self {
        Self::from_config(&OptionsConfig::default())
    }
}
