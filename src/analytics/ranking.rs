use std::collections::HashMap;

use crate::models::TopItem;

/// Highest `n` counts, ties broken by name. Never pads.
pub fn top_n(counts: HashMap<String, i64>, n: usize) -> Vec<TopItem> {
    let mut items: Vec<TopItem> = counts
        .into_iter()
        .map(|(name, count)| TopItem { name, count })
        .collect();

    items.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    items.truncate(n);
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, i64)]) -> HashMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_top_n_sorts_descending() {
        let items = top_n(counts(&[("a", 5), ("b", 10), ("c", 3), ("d", 8)]), 3);
        assert_eq!(
            items,
            vec![
                TopItem::new("b", 10),
                TopItem::new("d", 8),
                TopItem::new("a", 5)
            ]
        );
    }

    #[test]
    fn test_top_n_does_not_pad() {
        let items = top_n(counts(&[("a", 1)]), 5);
        assert_eq!(items.len(), 1);
        assert!(top_n(HashMap::new(), 5).is_empty());
    }

    #[test]
    fn test_top_n_ties_are_stable() {
        let items = top_n(counts(&[("zeta", 2), ("alpha", 2), ("mid", 2)]), 2);
        assert_eq!(items[0].name, "alpha");
        assert_eq!(items[1].name, "mid");
    }
}
