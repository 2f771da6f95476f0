//! Cookie header parsing and merging.

use std::collections::BTreeMap;

/// Parses `Cookie` header values into ordered `(name, value)` pairs.
///
/// Segments without `=` are dropped. A repeated name keeps its first position
/// and takes the last value.
pub fn parse_cookie_header<'a, I>(values: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut pairs: Vec<(String, String)> = Vec::new();
    for segment in values.into_iter().flat_map(|value| value.split(';')) {
        let Some((name, value)) = segment.trim().split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        upsert(&mut pairs, name, value.trim());
    }
    pairs
}

/// Overlays clearance cookies on top of the caller's cookies.
///
/// Clearance values win on collision; new names are appended in name order.
pub fn merge_cookies(
    mut inbound: Vec<(String, String)>,
    clearance: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    for (name, value) in clearance {
        upsert(&mut inbound, name, value);
    }
    inbound
}

pub fn serialize_cookies(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn upsert(pairs: &mut Vec<(String, String)>, name: &str, value: &str) {
    match pairs.iter_mut().find(|(existing, _)| existing == name) {
        Some(slot) => slot.1 = value.to_string(),
        None => pairs.push((name.to_string(), value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clearance(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn credential_cookies_win_and_append() {
        let inbound = parse_cookie_header(["a=1; b=2"]);
        let merged = merge_cookies(inbound, &clearance(&[("b", "9"), ("c", "3")]));
        assert_eq!(serialize_cookies(&merged), "a=1; b=9; c=3");
    }

    #[test]
    fn drops_malformed_segments_and_keeps_first_position() {
        let pairs = parse_cookie_header(["  x=1 ;flag; =orphan; y = 2", "x=3"]);
        assert_eq!(
            pairs,
            vec![
                ("x".to_string(), "3".to_string()),
                ("y".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn splits_value_at_first_equals() {
        let pairs = parse_cookie_header(["token=abc=def=="]);
        assert_eq!(pairs[0].1, "abc=def==");
    }

    #[test]
    fn no_inbound_cookies_yields_clearance_only() {
        let merged = merge_cookies(Vec::new(), &clearance(&[("cf_clearance", "tok")]));
        assert_eq!(serialize_cookies(&merged), "cf_clearance=tok");
    }
}
