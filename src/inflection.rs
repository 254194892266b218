//! Singular/plural name variants used to bind question words and repaired
//! identifiers to schema names.

use inflector::Inflector;

/// Irregular nouns that show up as table names
static IRREGULAR: &[(&str, &str)] = &[
    ("person", "people"),
    ("child", "children"),
    ("status", "statuses"),
    ("address", "addresses"),
    ("analysis", "analyses"),
    ("index", "indices"),
    ("datum", "data"),
    ("criterion", "criteria"),
];

pub fn singular(word: &str) -> String {
    let lower = word.to_lowercase();
    if let Some((s, _)) = IRREGULAR.iter().find(|(s, p)| *p == lower || *s == lower) {
        return s.to_string();
    }
    lower.to_singular()
}

pub fn plural(word: &str) -> String {
    let lower = word.to_lowercase();
    if let Some((_, p)) = IRREGULAR.iter().find(|(s, p)| *s == lower || *p == lower) {
        return p.to_string();
    }
    lower.to_plural()
}

/// The word itself plus its singular and plural forms, lower-cased, deduplicated
pub fn variants(word: &str) -> Vec<String> {
    let mut out = vec![word.to_lowercase()];
    for v in [singular(word), plural(word)] {
        if !v.is_empty() && !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

/// Whether two names refer to the same thing modulo case and number
pub fn same_noun(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b) || singular(a) == singular(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_forms() {
        assert_eq!(singular("customers"), "customer");
        assert_eq!(plural("order"), "orders");
        assert_eq!(singular("categories"), "category");
    }

    #[test]
    fn test_irregular_forms() {
        assert_eq!(plural("person"), "people");
        assert_eq!(singular("people"), "person");
        assert_eq!(singular("status"), "status");
    }

    #[test]
    fn test_same_noun() {
        assert!(same_noun("Customer", "customers"));
        assert!(!same_noun("customer", "orders"));
        assert!(variants("product").contains(&"products".to_string()));
    }
}
