//! XOR masking of frame payloads (RFC 6455 Section 5.3).
//!
//! Masking and unmasking are the same operation: every byte is XOR-ed with
//! `mask[i % 4]`, so applying a key twice restores the input.

/// Mask or unmask `buf` in place with the given key.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_words(buf, mask);
}

/// Byte-at-a-time masking, used for the tail that doesn't fill a word.
#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Masks four bytes at a time.
///
/// Chunks always start at a multiple of four from the beginning of `buf`, so
/// the key never needs rotating and the remainder lines up with `mask[0]`.
#[inline]
fn apply_mask_words(buf: &mut [u8], mask: [u8; 4]) {
    let key = u32::from_ne_bytes(mask);

    let mut words = buf.chunks_exact_mut(4);
    for word in &mut words {
        let value = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]) ^ key;
        word.copy_from_slice(&value.to_ne_bytes());
    }

    apply_mask_fallback(words.into_remainder(), mask);
}
