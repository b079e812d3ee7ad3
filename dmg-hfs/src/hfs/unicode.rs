//! UTF-16 names as stored in catalog and attribute keys.

use std::cmp::Ordering;

/// Reads big-endian UTF-16 code units.
pub(crate) fn units_from_be(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

pub(crate) fn decode(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

pub(crate) fn encode(name: &str) -> Vec<u16> {
    name.encode_utf16().collect()
}

/// Case-folds one code unit for HFS+ name comparison. NUL sorts after
/// every other unit.
pub(crate) fn fold_unit(unit: u16) -> u16 {
    if unit == 0 {
        return 0xFFFF;
    }

    let Some(c) = char::from_u32(unit.into()) else {
        return unit;
    };

    let mut lower = c.to_lowercase();

    match (lower.next(), lower.next()) {
        (Some(l), None) if (l as u32) <= 0xFFFF => l as u32 as u16,
        _ => unit,
    }
}

/// Compares names the way a case-insensitive HFS+ catalog orders them.
pub(crate) fn compare_folded(a: &[u16], b: &[u16]) -> Ordering {
    a.iter()
        .map(|&u| fold_unit(u))
        .cmp(b.iter().map(|&u| fold_unit(u)))
}

pub(crate) fn eq_folded(a: &[u16], b: &[u16]) -> bool {
    a.len() == b.len() && compare_folded(a, b) == Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_case_and_sorts_nul_last() {
        assert!(eq_folded(&encode("ReadMe.TXT"), &encode("readme.txt")));
        assert!(!eq_folded(&encode("readme"), &encode("readme2")));
        assert_eq!(compare_folded(&encode("B"), &encode("a")), Ordering::Greater);
        assert_eq!(compare_folded(&encode("\0x"), &encode("zzz")), Ordering::Greater);
        assert!(eq_folded(&encode("ÄÖ"), &encode("äö")));
    }

    #[test]
    fn decodes_big_endian_units() {
        let bytes = [0x00, b'h', 0x00, b'i', 0x00];

        assert_eq!(decode(&units_from_be(&bytes)), "hi");
    }
}
