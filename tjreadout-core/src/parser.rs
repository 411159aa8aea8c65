//! Low-level parsing of raw 32-bit FIFO words.
//!
//! This module classifies words by their high-order bits and extracts the
//! bit fields of each word type. The masks encode the hardware wire format
//! and must not change.

use crate::types::{Fragment, HitRecord, RawWord, WordTag, NUM_DOMAINS};

/// Bit that marks a trigger word.
pub const TRIGGER_BIT: u32 = 0x8000_0000;

/// Width of the hit timestamp carried by hit words 1 and 2.
pub const HIT_TIMESTAMP_BITS: u32 = 52;

/// Number of hit timestamp bits carried by hit word 1.
pub const HIT_LOW_TS_BITS: u32 = 28;

/// Trigger timestamp field widths supported by the trigger logic unit.
pub const TRIGGER_TIMESTAMP_WIDTHS: [u32; 3] = [15, 16, 19];

/// Extracts the 4-bit tag nibble of a word.
#[inline]
pub fn get_nibble(word: RawWord) -> u8 {
    ((word >> 28) & 0xF) as u8
}

/// Classifies a raw word into its [`WordTag`].
#[inline]
pub fn tag_word(word: RawWord) -> WordTag {
    if word & TRIGGER_BIT != 0 {
        return WordTag::Trigger;
    }
    match get_nibble(word) {
        0x1 => WordTag::HitWord0,
        0x2 => WordTag::HitWord1,
        0x3 => WordTag::HitWord2,
        nibble @ 0x4..=0x7 => match ts_get_fragment_id(word) {
            1 => WordTag::Timestamp {
                domain: nibble - 0x4,
                fragment: Fragment::Low,
            },
            2 => WordTag::Timestamp {
                domain: nibble - 0x4,
                fragment: Fragment::Mid,
            },
            3 => WordTag::Timestamp {
                domain: nibble - 0x4,
                fragment: Fragment::High,
            },
            _ => WordTag::Trash,
        },
        _ => WordTag::Trash,
    }
}

// ============================================================================
// HIT_WORD_0 (nibble = 0x1)
// Bits: [31:28] tag | [27:21] column | [20:13] row | [12:7] le | [6:1] te | [0] noise
// ============================================================================

/// Extracts the pixel column from a hit feature word.
#[inline]
pub fn hit_get_column(word: RawWord) -> u8 {
    ((word >> 21) & 0x7F) as u8
}

/// Extracts the pixel row from a hit feature word.
#[inline]
pub fn hit_get_row(word: RawWord) -> u8 {
    ((word >> 13) & 0xFF) as u8
}

/// Extracts the leading edge phase from a hit feature word.
#[inline]
pub fn hit_get_leading_edge(word: RawWord) -> u8 {
    ((word >> 7) & 0x3F) as u8
}

/// Extracts the trailing edge phase from a hit feature word.
#[inline]
pub fn hit_get_trailing_edge(word: RawWord) -> u8 {
    ((word >> 1) & 0x3F) as u8
}

/// Extracts the noise flag from a hit feature word.
#[inline]
pub fn hit_get_noise(word: RawWord) -> u8 {
    (word & 0x1) as u8
}

// ============================================================================
// HIT_WORD_1 (nibble = 0x2)
// Bits: [31:28] tag | [27:0] timestamp[27:0]
// ============================================================================

/// Extracts the low hit timestamp bits from hit word 1.
#[inline]
pub fn hit_get_timestamp_low(word: RawWord) -> u64 {
    (word & 0x0FFF_FFFF) as u64
}

// ============================================================================
// HIT_WORD_2 (nibble = 0x3)
// Bits: [31:28] tag | [27:24] unused | [23:0] timestamp[51:28]
// ============================================================================

/// Extracts the high hit timestamp bits from hit word 2, already shifted.
#[inline]
pub fn hit_get_timestamp_high(word: RawWord) -> u64 {
    ((word & 0x00FF_FFFF) as u64) << HIT_LOW_TS_BITS
}

// ============================================================================
// TIMESTAMP (nibble = 0x4 + domain)
// Bits: [31:28] tag | [27:24] fragment id | [23:0] payload
// ============================================================================

/// Extracts the fragment id (1 = low, 2 = mid, 3 = high) of a timestamp word.
#[inline]
pub fn ts_get_fragment_id(word: RawWord) -> u8 {
    ((word >> 24) & 0xF) as u8
}

/// Extracts the 24-bit payload of a timestamp word.
#[inline]
pub fn ts_get_payload(word: RawWord) -> u64 {
    (word & 0x00FF_FFFF) as u64
}

/// Bit widths of the three fragments of one clock domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainLayout {
    pub low_bits: u32,
    pub mid_bits: u32,
    pub high_bits: u32,
}

impl DomainLayout {
    /// Total width of the assembled counter.
    #[inline]
    pub const fn width(&self) -> u32 {
        self.low_bits + self.mid_bits + self.high_bits
    }

    /// Mask and shift to place a fragment payload into the counter.
    #[inline]
    pub fn place(&self, fragment: Fragment, payload: u64) -> u64 {
        match fragment {
            Fragment::Low => payload & mask(self.low_bits),
            Fragment::Mid => (payload & mask(self.mid_bits)) << self.low_bits,
            Fragment::High => {
                (payload & mask(self.high_bits)) << (self.low_bits + self.mid_bits)
            }
        }
    }
}

/// Fragment layouts of the four clock domains.
pub const DOMAIN_LAYOUTS: [DomainLayout; NUM_DOMAINS] = [
    DomainLayout {
        low_bits: 24,
        mid_bits: 24,
        high_bits: 16,
    },
    DomainLayout {
        low_bits: 24,
        mid_bits: 24,
        high_bits: 16,
    },
    DomainLayout {
        low_bits: 24,
        mid_bits: 24,
        high_bits: 8,
    },
    DomainLayout {
        low_bits: 16,
        mid_bits: 16,
        high_bits: 16,
    },
];

// ============================================================================
// TRIGGER (bit 31 set)
// Bits: [31] 1 | [30:w] trigger number | [w-1:0] narrow timestamp
// ============================================================================

/// Extracts the trigger number for a narrow timestamp field of `ts_bits`.
#[inline]
pub fn trigger_get_number(word: RawWord, ts_bits: u32) -> u32 {
    (word & !TRIGGER_BIT) >> ts_bits
}

/// Extracts the narrow timestamp field of `ts_bits` from a trigger word.
#[inline]
pub fn trigger_get_timestamp(word: RawWord, ts_bits: u32) -> u32 {
    word & (mask(ts_bits) as u32)
}

/// Widens a narrow trigger timestamp against a full-width snapshot.
///
/// The low `ts_bits` of the snapshot are replaced by the narrow field. If the
/// narrow field is below the snapshot's low bits the counter wrapped between
/// the snapshot and the trigger, so one wraparound unit is added.
#[inline]
pub fn widen_timestamp(snapshot: u64, narrow: u32, ts_bits: u32) -> u64 {
    let field_mask = mask(ts_bits);
    let narrow = narrow as u64 & field_mask;
    let mut widened = (snapshot & !field_mask) | narrow;
    if narrow < snapshot & field_mask {
        widened = widened.wrapping_add(1u64 << ts_bits);
    }
    widened
}

/// Low-bit mask of the given width; saturates at 64 bits.
#[inline]
pub const fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

// ============================================================================
// Encoding, for simulation and replay
// ============================================================================

/// Encodes a hit into its three-word wire representation.
///
/// Fields are masked to their wire widths; the duplicate flag is not part of
/// the wire format and is dropped.
pub fn encode_hit(hit: &HitRecord) -> [RawWord; 3] {
    let word0 = 0x1000_0000
        | ((hit.column as u32 & 0x7F) << 21)
        | ((hit.row as u32) << 13)
        | ((hit.leading_edge as u32 & 0x3F) << 7)
        | ((hit.trailing_edge as u32 & 0x3F) << 1)
        | (hit.flag as u32 & 0x1);
    let word1 = 0x2000_0000 | (hit.timestamp & 0x0FFF_FFFF) as u32;
    let word2 = 0x3000_0000 | ((hit.timestamp >> HIT_LOW_TS_BITS) & 0x00FF_FFFF) as u32;
    [word0, word1, word2]
}

/// Encodes a counter value of a clock domain into its low, mid and high words.
pub fn encode_timestamp(domain: u8, value: u64) -> [RawWord; 3] {
    let layout = DOMAIN_LAYOUTS[domain as usize % NUM_DOMAINS];
    let tag = (0x4 + (domain as u32 % NUM_DOMAINS as u32)) << 28;
    let low = value & mask(layout.low_bits);
    let mid = (value >> layout.low_bits) & mask(layout.mid_bits);
    let high = (value >> (layout.low_bits + layout.mid_bits)) & mask(layout.high_bits);
    [
        tag | (1 << 24) | low as u32,
        tag | (2 << 24) | mid as u32,
        tag | (3 << 24) | high as u32,
    ]
}

/// Encodes a trigger word with a narrow timestamp field of `ts_bits`.
pub fn encode_trigger(trigger_number: u32, narrow: u32, ts_bits: u32) -> RawWord {
    let number_mask = mask(31 - ts_bits) as u32;
    TRIGGER_BIT | ((trigger_number & number_mask) << ts_bits) | (narrow & mask(ts_bits) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagging() {
        assert_eq!(tag_word(0x1775_FC80), WordTag::HitWord0);
        assert_eq!(tag_word(0x2CB3_0B30), WordTag::HitWord1);
        assert_eq!(tag_word(0x3000_001F), WordTag::HitWord2);
        assert_eq!(tag_word(0x8000_1234), WordTag::Trigger);
        assert_eq!(tag_word(0xF000_0000), WordTag::Trigger);
        assert_eq!(tag_word(0x0000_0000), WordTag::Trash);
        assert_eq!(
            tag_word(0x5200_00AB),
            WordTag::Timestamp {
                domain: 1,
                fragment: Fragment::Mid
            }
        );
        // Unknown fragment id inside a timestamp nibble
        assert_eq!(tag_word(0x4400_0000), WordTag::Trash);
    }

    #[test]
    fn test_hit_feature_fields() {
        let word: u32 = 0x1775_FC80;
        assert_eq!(hit_get_column(word), 59);
        assert_eq!(hit_get_row(word), 175);
        assert_eq!(hit_get_leading_edge(word), 57);
        assert_eq!(hit_get_trailing_edge(word), 0);
        assert_eq!(hit_get_noise(word), 0);
    }

    #[test]
    fn test_hit_timestamp_fields() {
        let ts = hit_get_timestamp_low(0x2CB3_0B30) | hit_get_timestamp_high(0x3000_001F);
        assert_eq!(ts, 8_534_559_536);
    }

    #[test]
    fn test_domain_layout_placement() {
        let layout = DOMAIN_LAYOUTS[3];
        assert_eq!(layout.width(), 48);
        assert_eq!(layout.place(Fragment::Low, 0xFF_FFFF), 0xFFFF);
        assert_eq!(layout.place(Fragment::Mid, 0x1), 0x1_0000);
        assert_eq!(layout.place(Fragment::High, 0x2), 0x2_0000_0000);
        assert_eq!(DOMAIN_LAYOUTS[2].width(), 56);
    }

    #[test]
    fn test_trigger_fields() {
        let word = encode_trigger(0x1234, 0xBEEF, 16);
        assert_eq!(trigger_get_number(word, 16), 0x1234);
        assert_eq!(trigger_get_timestamp(word, 16), 0xBEEF);

        let word = encode_trigger(0x7FF, 0x7_FFFF, 19);
        assert_eq!(trigger_get_number(word, 19), 0x7FF);
        assert_eq!(trigger_get_timestamp(word, 19), 0x7_FFFF);
    }

    #[test]
    fn test_widen_without_wrap() {
        // Narrow field ahead of the snapshot low bits: plain substitution
        assert_eq!(widen_timestamp(0x12_0010, 0x0020, 16), 0x12_0020);
        // Equal low bits do not wrap
        assert_eq!(widen_timestamp(0x12_0010, 0x0010, 16), 0x12_0010);
    }

    #[test]
    fn test_widen_adds_exactly_one_wrap_unit() {
        for &bits in TRIGGER_TIMESTAMP_WIDTHS.iter() {
            let unit = 1u64 << bits;
            let snapshot = 5 * unit + (unit - 3);
            let widened = widen_timestamp(snapshot, 2, bits);
            assert_eq!(widened, 6 * unit + 2, "width {}", bits);
            assert!(widened > snapshot);
            assert!(widened - snapshot < unit);
        }
    }

    #[test]
    fn test_encode_timestamp_round_trip_fields() {
        let words = encode_timestamp(0, 0x0102_0304_0506_0708);
        assert_eq!(ts_get_fragment_id(words[0]), 1);
        assert_eq!(ts_get_payload(words[0]), 0x06_0708);
        assert_eq!(ts_get_payload(words[1]), 0x03_0405);
        assert_eq!(ts_get_payload(words[2]), 0x0102);
    }
}
