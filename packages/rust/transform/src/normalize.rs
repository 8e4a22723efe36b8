//! Candidate → [`CanonicalProduct`] normalization.

use std::collections::{HashMap, HashSet};

use catalogsync_shared::{
    CanonicalId, CanonicalProduct, Candidate, CategoryPath, NormalizedVariant, VendorVariant,
    slugify,
};

use crate::dedup::SkipReason;
use crate::options::OptionRules;

/// Why a candidate could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("product {vendor_id} has no variants")]
    NoVariants { vendor_id: String },
}

impl NormalizeError {
    pub fn skip_reason(&self) -> SkipReason {
        match self {
            Self::NoVariants { .. } => SkipReason::NoVariants,
        }
    }
}

/// Pure, synchronous product normalizer.
#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: OptionRules,
    sku_prefix_len: usize,
}

impl Normalizer {
    pub fn new(rules: OptionRules, sku_prefix_len: usize) -> Self {
        Self {
            rules,
            sku_prefix_len: sku_prefix_len.max(1),
        }
    }

    pub fn normalize(
        &self,
        candidate: &Candidate,
        category: CategoryPath,
    ) -> Result<CanonicalProduct, NormalizeError> {
        let product = &candidate.product;
        if product.variants.is_empty() {
            return Err(NormalizeError::NoVariants {
                vendor_id: product.id.clone(),
            });
        }

        let prefix = sku_prefix(&product.vendor, self.sku_prefix_len);

        let mut sku_counts: HashMap<&str, usize> = HashMap::new();
        for variant in &product.variants {
            if let Some(sku) = vendor_sku(variant) {
                *sku_counts.entry(sku).or_default() += 1;
            }
        }

        // Unique vendor SKUs are reserved first; synthesized ones step around them.
        let mut taken: HashSet<String> = sku_counts
            .iter()
            .filter(|(_, count)| **count == 1)
            .map(|(sku, _)| sku.to_string())
            .collect();
        let skus: Vec<String> = product
            .variants
            .iter()
            .map(|variant| match vendor_sku(variant) {
                Some(sku) if sku_counts.get(sku) == Some(&1) => sku.to_string(),
                _ => {
                    let base = format!("{prefix}-{}", variant.id);
                    let mut sku = base.clone();
                    let mut n = 2;
                    while !taken.insert(sku.clone()) {
                        sku = format!("{base}-{n}");
                        n += 1;
                    }
                    sku
                }
            })
            .collect();

        let variants: Vec<NormalizedVariant> = product
            .variants
            .iter()
            .zip(skus)
            .map(|(variant, sku)| {
                let price = parse_price(variant.price.as_deref());
                let compare_at_price = variant
                    .compare_at_price
                    .as_deref()
                    .map(|raw| parse_price(Some(raw)))
                    .filter(|p| *p > 0.0);
                NormalizedVariant {
                    id: variant.id.clone(),
                    title: variant.title.clone(),
                    sku,
                    price,
                    compare_at_price,
                    on_sale: compare_at_price.is_some_and(|c| c > price),
                    options: self.rules.parse(&option_source(variant), &product.product_type),
                    available: variant
                        .available
                        .unwrap_or_else(|| variant.inventory_quantity.is_none_or(|q| q > 0)),
                    inventory_quantity: variant.inventory_quantity,
                }
            })
            .collect();

        let handle = if product.handle.trim().is_empty() {
            slugify(&product.title)
        } else {
            product.handle.clone()
        };

        Ok(CanonicalProduct {
            id: CanonicalId::from_vendor_id(&product.id),
            vendor_id: product.id.clone(),
            title: product.title.trim().to_string(),
            handle,
            vendor: product.vendor.trim().to_string(),
            product_type: product.product_type.trim().to_string(),
            category,
            on_sale: variants.iter().any(|v| v.on_sale),
            variants,
            images: product
                .images
                .iter()
                .map(|img| img.src.trim().to_string())
                .filter(|src| !src.is_empty())
                .collect(),
            tags: product.tags.clone(),
            collections: candidate.collections.iter().cloned().collect(),
            body_html: product.body_html.clone().filter(|b| !b.trim().is_empty()),
            first_seen_at: candidate.first_seen_at,
        })
    }
}

/// Parse a decimal price string rounded to cents. Invalid input is `0.0`.
pub fn parse_price(raw: Option<&str>) -> f64 {
    let Some(raw) = raw else { return 0.0 };
    let cleaned = raw.trim().trim_start_matches('$').replace(',', "");
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => round_to(v, 2),
        _ => 0.0,
    }
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

fn vendor_sku(variant: &VendorVariant) -> Option<&str> {
    variant.sku.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Text the option rules read: the variant title, or the joined option values.
fn option_source(variant: &VendorVariant) -> String {
    if !variant.title.trim().is_empty() {
        return variant.title.clone();
    }
    [&variant.option1, &variant.option2, &variant.option3]
        .into_iter()
        .flatten()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" / ")
}

fn sku_prefix(vendor: &str, len: usize) -> String {
    let prefix: String = vendor
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(len)
        .collect::<String>()
        .to_ascii_uppercase();
    if prefix.is_empty() {
        "SKU".into()
    } else {
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalogsync_shared::{VendorImage, VendorProduct};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    fn variant(id: &str, title: &str, price: &str, compare: Option<&str>) -> VendorVariant {
        VendorVariant {
            id: id.into(),
            title: title.into(),
            sku: None,
            price: Some(price.into()),
            compare_at_price: compare.map(String::from),
            option1: None,
            option2: None,
            option3: None,
            available: None,
            inventory_quantity: None,
        }
    }

    fn candidate(variants: Vec<VendorVariant>) -> Candidate {
        Candidate {
            product: VendorProduct {
                id: "8123".into(),
                title: "Brass Nozzle".into(),
                handle: "brass-nozzle".into(),
                vendor: "Acme Parts".into(),
                product_type: "Nozzle".into(),
                tags: vec!["brass".into()],
                images: vec![VendorImage {
                    src: "https://cdn.example.com/n.jpg".into(),
                }],
                body_html: Some("<p>Brass.</p>".into()),
                variants,
                source_collections: vec!["nozzles".into()],
            },
            collections: BTreeSet::from(["nozzles".to_string()]),
            first_seen_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn category() -> CategoryPath {
        CategoryPath {
            handles: vec!["hotends".into(), "nozzles".into()],
            names: vec!["Hotends".into(), "Nozzles".into()],
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(OptionRules::default(), 3)
    }

    #[test]
    fn nozzle_variant_is_parsed_and_priced() {
        let product = normalizer()
            .normalize(&candidate(vec![variant("1", "V6 / 0.4mm", "19.99", None)]), category())
            .unwrap();

        assert_eq!(product.id.as_str(), "prod_8123");
        let v = &product.variants[0];
        assert_eq!(v.price, 19.99);
        assert!(!v.on_sale);
        assert_eq!(v.options["Nozzle Type"], "V6");
        assert_eq!(v.options["Nozzle Size"], "0.4mm");
        assert_eq!(product.category.to_string(), "hotends/nozzles");
    }

    #[test]
    fn on_sale_only_when_compare_at_is_strictly_greater() {
        let product = normalizer()
            .normalize(
                &candidate(vec![
                    variant("1", "A", "10.00", Some("12.50")),
                    variant("2", "B", "10.00", Some("10.00")),
                    variant("3", "C", "10.00", Some("8.00")),
                    variant("4", "D", "10.00", None),
                ]),
                category(),
            )
            .unwrap();

        let flags: Vec<bool> = product.variants.iter().map(|v| v.on_sale).collect();
        assert_eq!(flags, vec![true, false, false, false]);
        assert!(product.on_sale);
    }

    #[test]
    fn invalid_prices_become_zero() {
        assert_eq!(parse_price(Some("abc")), 0.0);
        assert_eq!(parse_price(None), 0.0);
        assert_eq!(parse_price(Some("-3")), 0.0);
        assert_eq!(parse_price(Some(" 1,299.456 ")), 1299.46);
        assert_eq!(parse_price(Some("$5")), 5.0);
    }

    #[test]
    fn zero_variants_is_an_error() {
        let err = normalizer().normalize(&candidate(vec![]), category()).unwrap_err();
        assert_eq!(err.skip_reason(), SkipReason::NoVariants);
    }

    #[test]
    fn sku_synthesized_when_missing_or_duplicated() {
        let mut a = variant("11", "A", "1", None);
        a.sku = Some("DUP".into());
        let mut b = variant("12", "B", "1", None);
        b.sku = Some("DUP".into());
        let mut c = variant("13", "C", "1", None);
        c.sku = Some(" NZ-04 ".into());
        let d = variant("14", "D", "1", None);

        let product = normalizer().normalize(&candidate(vec![a, b, c, d]), category()).unwrap();
        let skus: Vec<&str> = product.variants.iter().map(|v| v.sku.as_str()).collect();
        assert_eq!(skus, vec!["ACM-11", "ACM-12", "NZ-04", "ACM-14"]);
    }

    #[test]
    fn synthesized_sku_steps_around_vendor_sku() {
        let a = variant("11", "A", "1", None);
        let mut b = variant("12", "B", "1", None);
        b.sku = Some("ACM-11".into());
        let c = variant("13", "C", "1", None);
        let mut d = variant("14", "D", "1", None);
        d.sku = Some("ACM-13".into());
        let mut e = variant("15", "E", "1", None);
        e.sku = Some("ACM-13-2".into());

        let product = normalizer().normalize(&candidate(vec![a, b, c, d, e]), category()).unwrap();
        let skus: Vec<&str> = product.variants.iter().map(|v| v.sku.as_str()).collect();
        assert_eq!(skus, vec!["ACM-11-2", "ACM-11", "ACM-13-3", "ACM-13", "ACM-13-2"]);

        let unique: HashSet<&str> = skus.iter().copied().collect();
        assert_eq!(unique.len(), skus.len());
    }

    #[test]
    fn options_read_option_values_when_title_missing() {
        let mut v = variant("1", "", "5", None);
        v.option1 = Some("Red".into());
        v.option2 = Some("Large".into());
        let product = normalizer().normalize(&candidate(vec![v]), category()).unwrap();
        assert_eq!(product.variants[0].options["Color"], "Red");
        assert_eq!(product.variants[0].options["Size"], "Large");
    }

    #[test]
    fn availability_follows_inventory_when_flag_absent() {
        let mut sold_out = variant("1", "A", "5", None);
        sold_out.inventory_quantity = Some(0);
        let mut flagged = variant("2", "B", "5", None);
        flagged.available = Some(true);
        flagged.inventory_quantity = Some(0);
        let unknown = variant("3", "C", "5", None);

        let product = normalizer()
            .normalize(&candidate(vec![sold_out, flagged, unknown]), category())
            .unwrap();
        let avail: Vec<bool> = product.variants.iter().map(|v| v.available).collect();
        assert_eq!(avail, vec![false, true, true]);
    }

    #[test]
    fn one_normalized_variant_per_vendor_variant() {
        let product = normalizer()
            .normalize(
                &candidate(vec![
                    variant("1", "Default Title", "3", None),
                    variant("2", "Default Title", "3", None),
                ]),
                category(),
            )
            .unwrap();
        assert_eq!(product.variants.len(), 2);
        assert!(product.variants.iter().all(|v| v.options.is_empty()));
    }
}
