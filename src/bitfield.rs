use bit_vec::BitVec;

/// Fixed length bit vector describing which pieces are present.
///
/// Bits are packed MSB-first: bit 0 of the field is the most significant bit of
/// byte 0, which is the layout of the `bitfield` wire message. Indexing outside
/// of `0..len` is a programming error and panics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitField {
    inner: BitVec,
}

impl BitField {
    /// A zeroed bitfield of `len` bits, backed by `ceil(len / 8)` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            inner: BitVec::from_elem(len, false),
        }
    }

    /// A bitfield of `len` bits initialised from received bytes.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let mut field = Self::new(len);
        field.set_bytes(bytes);
        field
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Number of bytes of the packed representation.
    #[inline]
    pub fn byte_len(&self) -> usize {
        (self.len() + 7) / 8
    }

    pub fn get(&self, index: usize) -> bool {
        self.check_index(index);
        self.inner[index]
    }

    pub fn set(&mut self, index: usize, value: bool) {
        self.check_index(index);
        self.inner.set(index, value);
    }

    /// Copy of the packed bytes, spare bits of the last byte are zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes()
    }

    /// Overwrite every bit from a packed byte buffer.
    ///
    /// At most `ceil(len / 8)` bytes are read. Spare bits past `len` are
    /// ignored, bits whose byte is missing from `bytes` are cleared.
    pub fn set_bytes(&mut self, bytes: &[u8]) {
        for index in 0..self.len() {
            let bit = bytes
                .get(index / 8)
                .map(|byte| (byte >> (7 - index % 8)) & 1 == 1)
                .unwrap_or(false);
            self.inner.set(index, bit);
        }
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.inner.iter().filter(|bit| *bit).count()
    }

    /// Whether every bit is set.
    pub fn is_complete(&self) -> bool {
        self.inner.all()
    }

    /// returns the index of the first set bit
    pub fn first_set(&self) -> Option<usize> {
        self.inner.iter().position(|bit| bit)
    }

    /// Indices of all bits that are still unset.
    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        self.inner
            .iter()
            .enumerate()
            .filter(|(_, bit)| !*bit)
            .map(|(index, _)| index)
    }

    pub fn iter(&self) -> bit_vec::Iter<'_> {
        self.inner.iter()
    }

    fn check_index(&self, index: usize) {
        assert!(
            index < self.len(),
            "bit index {} out of range for bitfield of length {}",
            index,
            self.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_zeroed() {
        let field = BitField::new(13);
        assert_eq!(field.len(), 13);
        assert_eq!(field.to_bytes(), vec![0, 0]);
        assert_eq!(field.count_ones(), 0);
    }

    #[test]
    fn msb_first_packing() {
        let mut field = BitField::new(16);
        field.set(0, true);
        field.set(9, true);
        assert_eq!(field.to_bytes(), vec![0b1000_0000, 0b0100_0000]);
        assert!(field.get(0));
        assert!(!field.get(1));
        assert!(field.get(9));

        field.set(0, false);
        assert_eq!(field.to_bytes(), vec![0, 0b0100_0000]);
    }

    #[test]
    fn all_set_packing() {
        let mut eight = BitField::new(8);
        let mut nine = BitField::new(9);
        (0..8).for_each(|i| eight.set(i, true));
        (0..9).for_each(|i| nine.set(i, true));
        assert_eq!(eight.to_bytes(), vec![0xFF]);
        assert_eq!(nine.to_bytes(), vec![0xFF, 0x80]);
        assert!(nine.is_complete());
    }

    #[test]
    fn bytes_round_trip() {
        for len in 1..40 {
            let mut field = BitField::new(len);
            for i in (0..len).filter(|i| i % 3 == 0 || i % 7 == 1) {
                field.set(i, true);
            }
            let mut copy = BitField::new(len);
            copy.set_bytes(&field.to_bytes());
            assert_eq!(field, copy, "length {}", len);
        }
    }

    #[test]
    fn set_bytes_ignores_spare_bits_and_extra_bytes() {
        let field = BitField::from_bytes(&[0xFF, 0xFF, 0xFF], 9);
        assert_eq!(field.count_ones(), 9);
        assert_eq!(field.to_bytes(), vec![0xFF, 0x80]);
    }

    #[test]
    fn set_bytes_clears_missing_bytes() {
        let mut field = BitField::new(16);
        (0..16).for_each(|i| field.set(i, true));
        field.set_bytes(&[0x0F]);
        assert_eq!(field.to_bytes(), vec![0x0F, 0x00]);
    }

    #[test]
    fn missing_pieces() {
        let field = BitField::from_bytes(&[0b1010_0000], 4);
        assert_eq!(field.missing().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(field.first_set(), Some(0));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn get_out_of_range_panics() {
        BitField::new(8).get(8);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn set_out_of_range_panics() {
        BitField::new(9).set(9, true);
    }
}
