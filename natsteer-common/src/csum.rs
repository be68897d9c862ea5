// Incremental internet-checksum updates (RFC 1071 / RFC 1624 style).
//
// A stored checksum is the one's complement of the one's-complement sum of
// the covered 16-bit words. When a single word changes from `old` to `new`
// the stored value can be fixed up without touching the rest of the data:
//
//   HC' = ~( ~HC + ~old + new )
//
// All arithmetic is carried in a u32 accumulator and folded back to 16 bits
// with end-around carry. The fold is a fixed two-step reduction, never a
// data-dependent loop.

/// Folds a 32-bit one's-complement accumulator down to 16 bits.
#[inline]
pub fn fold(sum: u32) -> u16 {
    let sum = (sum & 0xffff) + (sum >> 16);
    let sum = (sum & 0xffff) + (sum >> 16);
    sum as u16
}

/// Accumulator contribution for replacing one 16-bit word.
#[inline]
pub fn diff16(old: u16, new: u16) -> u32 {
    (!old as u32) + (new as u32)
}

/// Accumulator contribution for replacing one 32-bit field, e.g. an IPv4
/// address covered by the UDP/TCP pseudo-header.
#[inline]
pub fn diff32(old: u32, new: u32) -> u32 {
    diff16((old >> 16) as u16, (new >> 16) as u16) + diff16(old as u16, new as u16)
}

/// Applies an accumulated delta to a stored checksum field.
#[inline]
pub fn apply(check: u16, delta: u32) -> u16 {
    !fold((!check as u32) + delta)
}

/// Updates a stored checksum for a single 16-bit word change.
#[inline]
pub fn replace16(check: u16, old: u16, new: u16) -> u16 {
    apply(check, diff16(old, new))
}

/// Updates a stored checksum for a single 32-bit field change.
#[inline]
pub fn replace32(check: u16, old: u32, new: u32) -> u16 {
    apply(check, diff32(old, new))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference checksum over 16-bit words, from scratch.
    fn checksum(words: &[u16]) -> u16 {
        let mut sum: u32 = 0;
        for w in words {
            sum += *w as u32;
        }
        !fold(sum)
    }

    #[test]
    fn replace16_matches_recomputation() {
        let mut words = [0x4500u16, 0x0054, 0x1c46, 0x4000, 0x4011, 0xb1e6];
        let before = checksum(&words);

        let old = words[3];
        words[3] = 0x1234;
        let after = checksum(&words);

        assert_eq!(replace16(before, old, 0x1234), after);
    }

    #[test]
    fn replace32_matches_recomputation() {
        let mut words = [0x0a00u16, 0x0001, 0x0a00, 0x0002, 0x0011, 0x002a];
        let before = checksum(&words);

        // Change the 32-bit field spanning words[2..4].
        let old = ((words[2] as u32) << 16) | words[3] as u32;
        let new = 0xc0a8_0107u32;
        words[2] = (new >> 16) as u16;
        words[3] = new as u16;
        let after = checksum(&words);

        assert_eq!(replace32(before, old, new), after);
    }

    #[test]
    fn identity_change_is_a_noop() {
        assert_eq!(replace16(0xb1e6, 0x4000, 0x4000), 0xb1e6);
        assert_eq!(replace32(0x1234, 0xdeadbeef, 0xdeadbeef), 0x1234);
    }

    #[test]
    fn swapping_two_words_is_checksum_neutral() {
        // Exchanging the values of two covered words must leave the stored
        // checksum unchanged once both replacements are applied.
        let check = 0x8a31u16;
        let (a, b) = (0x1388u16, 0x107eu16);
        let check = replace16(check, a, b);
        let check = replace16(check, b, a);
        assert_eq!(check, 0x8a31);
    }

    #[test]
    fn fold_handles_large_accumulators() {
        assert_eq!(fold(0x0001_fffe), 0xffff);
        assert_eq!(fold(0x0004_fffb), 0xffff);
        assert_eq!(fold(0xffff_ffff), 0xffff);
    }
}
