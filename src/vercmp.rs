//! RPM-style version comparison and EVR ordering.

use std::cmp::Ordering;

/// Compare two version strings the way rpm does: split into maximal
/// alphabetic or numeric segments, numeric segments beat alphabetic
/// ones, tilde sorts before anything including end of string.
pub fn vercmp(a: &str, b: &str) -> Ordering {
    let mut a = a.as_bytes();
    let mut b = b.as_bytes();

    loop {
        // Tilde handling comes before separator skipping.
        match (a.first() == Some(&b'~'), b.first() == Some(&b'~')) {
            (true, true) => {
                a = &a[1..];
                b = &b[1..];
                continue;
            }
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        skip_separators(&mut a);
        skip_separators(&mut b);
        if a.is_empty() || b.is_empty() {
            break;
        }

        let numeric = a[0].is_ascii_digit();
        let seg_a = take_segment(&mut a, numeric);
        let seg_b = take_segment(&mut b, numeric);
        if seg_b.is_empty() {
            // Different segment types: numeric segments are newer.
            return if numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let ord = if numeric {
            let seg_a = trim_leading_zeros(seg_a);
            let seg_b = trim_leading_zeros(seg_b);
            seg_a.len().cmp(&seg_b.len()).then_with(|| seg_a.cmp(seg_b))
        } else {
            seg_a.cmp(seg_b)
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    a.len().cmp(&b.len())
}

fn skip_separators(s: &mut &[u8]) {
    while let Some(&c) = s.first() {
        if c.is_ascii_alphanumeric() || c == b'~' {
            break;
        }
        *s = &s[1..];
    }
}

fn take_segment<'a>(s: &mut &'a [u8], numeric: bool) -> &'a [u8] {
    let end = s
        .iter()
        .position(|&c| {
            if numeric {
                !c.is_ascii_digit()
            } else {
                !c.is_ascii_alphabetic()
            }
        })
        .unwrap_or(s.len());
    let (seg, rest) = s.split_at(end);
    *s = rest;
    seg
}

fn trim_leading_zeros(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&c| c != b'0').unwrap_or(s.len());
    &s[start..]
}

/// Epoch/version/release tuple. A missing epoch is stored as NULL in the
/// database and compares smaller than any explicit epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evr {
    pub epoch: Option<i32>,
    pub version: String,
    pub release: String,
}

impl Evr {
    pub fn new(epoch: Option<i32>, version: &str, release: &str) -> Evr {
        Evr {
            epoch,
            version: version.to_string(),
            release: release.to_string(),
        }
    }
}

impl Ord for Evr {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.epoch, other.epoch) {
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(a), Some(b)) if a != b => return a.cmp(&b),
            _ => {}
        }
        vercmp(&self.version, &other.version)
            .then_with(|| vercmp(&self.release, &other.release))
    }
}

impl PartialOrd for Evr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(a: &str, b: &str, expected: Ordering) {
        assert_eq!(vercmp(a, b), expected, "{} vs {}", a, b);
        assert_eq!(vercmp(b, a), expected.reverse(), "{} vs {}", b, a);
    }

    #[test]
    fn test_vercmp() {
        check("1.0", "1.0", Ordering::Equal);
        check("1.0", "1.1", Ordering::Less);
        check("2.0", "1.9.9", Ordering::Greater);
        check("1.0a", "1.0", Ordering::Greater);
        check("1.05", "1.5", Ordering::Equal);
        check("10", "9", Ordering::Greater);
        check("1.0.rc1", "1.0", Ordering::Greater);
        check("alpha", "beta", Ordering::Less);
        check("2.88", "2.9", Ordering::Greater);
    }

    #[test]
    fn test_tilde() {
        check("1.0~rc1", "1.0", Ordering::Less);
        check("1.0~rc1", "1.0~rc2", Ordering::Less);
        check("1.0~~", "1.0~", Ordering::Less);
    }

    #[test]
    fn test_evr_epoch() {
        let none = Evr::new(None, "2.0", "1");
        let zero = Evr::new(Some(0), "1.0", "1");
        let one = Evr::new(Some(1), "0.1", "1");
        assert!(none < zero);
        assert!(zero < one);
        assert!(
            Evr::new(Some(0), "1.0", "2.fc18") > Evr::new(Some(0), "1.0", "1.fc18")
        );
    }
}
