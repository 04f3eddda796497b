//! Helpers for dot-delimited hierarchical task ids ("2", "2.1", "2.10").

use std::cmp::Ordering;

/// Numeric components of an id. Non-numeric components sort after numeric ones.
fn components(id: &str) -> impl Iterator<Item = Result<u64, &str>> {
    id.split('.').map(|part| part.parse::<u64>().map_err(|_| part))
}

/// Compare two ids component by component, numerically ("2.9" < "2.10").
pub fn compare_ids(left: &str, right: &str) -> Ordering {
    let mut lhs = components(left);
    let mut rhs = components(right);
    loop {
        match (lhs.next(), rhs.next()) {
            (None, None) => return left.cmp(right),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(a), Some(b)) => {
                let ord = match (a, b) {
                    (Ok(a), Ok(b)) => a.cmp(&b),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(a), Err(b)) => a.cmp(b),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Sort key wrapper so ids can live in ordered collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdKey(pub String);

impl Ord for IdKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_ids(&self.0, &other.0)
    }
}

impl PartialOrd for IdKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// True when `child` is a direct compound child of `parent` ("2.1" of "2").
pub fn is_child_of(child: &str, parent: &str) -> bool {
    child
        .strip_prefix(parent)
        .and_then(|rest| rest.strip_prefix('.'))
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('.'))
}

/// True when every component is a non-empty run of ASCII digits.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_numerically_per_component() {
        assert_eq!(compare_ids("2.9", "2.10"), Ordering::Less);
        assert_eq!(compare_ids("10", "9"), Ordering::Greater);
        assert_eq!(compare_ids("1", "1.1"), Ordering::Less);
        assert_eq!(compare_ids("1.2", "2"), Ordering::Less);
        assert_eq!(compare_ids("3.1", "3.1"), Ordering::Equal);
    }

    #[test]
    fn sorts_with_id_key() {
        let mut ids = vec!["10", "2.10", "2.9", "1", "2"]
            .into_iter()
            .map(|id| IdKey(id.to_string()))
            .collect::<Vec<_>>();
        ids.sort();
        let sorted: Vec<&str> = ids.iter().map(|key| key.0.as_str()).collect();
        assert_eq!(sorted, vec!["1", "2", "2.9", "2.10", "10"]);
    }

    #[test]
    fn child_relation_is_direct_only() {
        assert!(is_child_of("2.1", "2"));
        assert!(!is_child_of("2.1.1", "2"));
        assert!(!is_child_of("21", "2"));
        assert!(!is_child_of("2", "2"));
    }

    #[test]
    fn validates_id_shape() {
        assert!(is_valid_id("1"));
        assert!(is_valid_id("12.3"));
        assert!(!is_valid_id("1."));
        assert!(!is_valid_id("a.1"));
        assert!(!is_valid_id(""));
    }
}
