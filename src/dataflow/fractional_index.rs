//! Lexicographic fractional indices (spec §4.3's "fractional index").
//!
//! Keys are strings of ASCII digits `'0'..='9'` interpreted as the digits after a decimal
//! point, so ordinary byte-wise string comparison (`<`) matches numeric order: `"2" < "25"`
//! exactly as `0.2 < 0.25`. `key_between` produces a fresh key strictly between two existing
//! ones (or past a single bound) without ever renumbering the neighbours.

/// Returns a key strictly greater than `lo` and strictly less than `hi` (when both given);
/// past `lo` alone when `hi` is `None`; before `hi` alone when `lo` is `None`; or an arbitrary
/// starting key when both are `None`.
pub fn key_between(lo: Option<&str>, hi: Option<&str>) -> String {
    match (lo, hi) {
        (None, None) => "5".to_string(),
        (Some(l), None) => format!("{l}5"),
        (None, Some(h)) => between_digits(&[], &digits(h)),
        (Some(l), Some(h)) => between_digits(&digits(l), &digits(h)),
    }
}

fn digits(s: &str) -> Vec<u8> {
    s.bytes().map(|b| b - b'0').collect()
}

fn between_digits(lo: &[u8], hi: &[u8]) -> String {
    let mut result = Vec::new();
    let mut i = 0;
    let mut hi_bounded = true;
    loop {
        let l = *lo.get(i).unwrap_or(&0);
        if !hi_bounded {
            if i < lo.len() {
                result.push(l);
                i += 1;
                continue;
            } else {
                result.push(5);
                break;
            }
        }
        if i >= hi.len() {
            // `lo` has a real digit where `hi` has run out; treat `hi` as unbounded from
            // here on (the precondition lo < hi guarantees this only happens when the
            // common prefix already diverged in lo's favor further up, which callers of
            // this module never trigger since they always pass lo < hi).
            hi_bounded = false;
            continue;
        }
        let h = hi[i];
        if l == h {
            result.push(l);
            i += 1;
        } else if h > l + 1 {
            result.push(l + (h - l) / 2);
            break;
        } else {
            result.push(l);
            hi_bounded = false;
            i += 1;
        }
    }
    result.into_iter().map(|d| (b'0' + d) as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_between_two_bounds() {
        let k = key_between(Some("2"), Some("3"));
        assert!(k.as_str() > "2" && k.as_str() < "3");
    }

    #[test]
    fn orders_with_close_neighbours() {
        let k = key_between(Some("12"), Some("13"));
        assert!(k.as_str() > "12" && k.as_str() < "13", "{k}");
    }

    #[test]
    fn orders_past_a_single_lower_bound() {
        let k = key_between(Some("9"), None);
        assert!(k.as_str() > "9");
    }

    #[test]
    fn orders_before_a_single_upper_bound() {
        let k = key_between(None, Some("1"));
        assert!(k.as_str() < "1");
    }

    #[test]
    fn insert_shifted_window_scenario() {
        // topK scenario from spec §8.6: order by value, window c,d,e; insert "a" at front.
        let c = key_between(None, None);
        let d = key_between(Some(&c), None);
        let e = key_between(Some(&d), None);
        let a = key_between(None, Some(&c));
        let mut window = vec![("c", c), ("d", d), ("e", e)];
        window.push(("a", a));
        window.sort_by(|x, y| x.1.cmp(&y.1));
        let order: Vec<_> = window.iter().map(|(v, _)| *v).collect();
        assert_eq!(order, vec!["a", "c", "d", "e"]);
    }
}
