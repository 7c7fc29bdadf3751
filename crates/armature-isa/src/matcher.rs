//! Decoder matcher engine
//!
//! A decode table is a declarative, ordered list of rows. Each row carries a
//! human-readable name, a bit mask, the expected value after masking, and a
//! handler that extracts fields from the word into a typed instruction value.
//! `matches(word)` is `(word & mask) == expected`; lookup scans rows in
//! declaration order and takes the first hit, so overlapping patterns are
//! disambiguated purely by ordering (more specific rows first). Every table
//! ends with a catch-all sentinel row decoding to the undefined-instruction
//! value, so lookup is total.

/// A single pattern row in a decode table.
pub struct Matcher<W, I> {
    name: &'static str,
    mask: W,
    expected: W,
    handler: fn(W) -> I,
}

impl<W: Word, I> Matcher<W, I> {
    /// Build a row from a pattern string.
    ///
    /// The pattern is one character per bit, most significant first: '0' and
    /// '1' are fixed bits, any other character is a field placeholder the
    /// handler extracts itself.
    pub fn new(name: &'static str, pattern: &str, handler: fn(W) -> I) -> Matcher<W, I> {
        assert_eq!(pattern.len(), W::BITS, "pattern width mismatch for {name}");
        let (mask, expected) = parse_pattern(pattern);
        Matcher {
            name,
            mask: W::from_u32(mask),
            expected: W::from_u32(expected),
            handler,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mask(&self) -> W {
        self.mask
    }

    pub fn expected(&self) -> W {
        self.expected
    }

    /// Whether this row matches the given instruction word.
    pub fn matches(&self, word: W) -> bool {
        word.and(self.mask) == self.expected
    }

    /// Run the row's handler on the word.
    pub fn decode(&self, word: W) -> I {
        (self.handler)(word)
    }
}

/// An ordered decode table with a sentinel fallback row.
pub struct DecodeTable<W, I> {
    rows: Vec<Matcher<W, I>>,
}

impl<W: Word, I> DecodeTable<W, I> {
    /// Build a table. The last row must be a catch-all (mask 0), which acts
    /// as the undefined-instruction sentinel.
    pub fn new(rows: Vec<Matcher<W, I>>) -> DecodeTable<W, I> {
        let sentinel = rows.last().expect("decode table must not be empty");
        assert!(
            sentinel.mask == W::from_u32(0),
            "decode table must end with a catch-all sentinel row"
        );
        DecodeTable { rows }
    }

    /// Find the first matching row. Total thanks to the sentinel.
    pub fn lookup(&self, word: W) -> &Matcher<W, I> {
        self.rows
            .iter()
            .find(|m| m.matches(word))
            .expect("sentinel row matches everything")
    }

    /// Decode a word straight to its instruction value.
    pub fn decode(&self, word: W) -> I {
        self.lookup(word).decode(word)
    }

    pub fn rows(&self) -> &[Matcher<W, I>] {
        &self.rows
    }
}

/// Instruction word widths the engine decodes (u16 for Thumb, u32 otherwise).
pub trait Word: Copy + PartialEq {
    fn from_u32(v: u32) -> Self;
    fn and(self, other: Self) -> Self;
    const BITS: usize;
}

impl Word for u32 {
    fn from_u32(v: u32) -> Self {
        v
    }
    fn and(self, other: Self) -> Self {
        self & other
    }
    const BITS: usize = 32;
}

impl Word for u16 {
    fn from_u32(v: u32) -> Self {
        v as u16
    }
    fn and(self, other: Self) -> Self {
        self & other
    }
    const BITS: usize = 16;
}

fn parse_pattern(pattern: &str) -> (u32, u32) {
    let mut mask = 0u32;
    let mut expected = 0u32;
    for ch in pattern.chars() {
        mask <<= 1;
        expected <<= 1;
        match ch {
            '0' => mask |= 1,
            '1' => {
                mask |= 1;
                expected |= 1;
            }
            _ => {}
        }
    }
    (mask, expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestInstr {
        Specific(u32),
        Generic(u32),
        Undefined,
    }

    fn table() -> DecodeTable<u32, TestInstr> {
        DecodeTable::new(vec![
            Matcher::new(
                "specific",
                "00000000000000000000000011111111",
                TestInstr::Specific,
            ),
            Matcher::new(
                "generic",
                "000000000000000000000000vvvvvvvv",
                TestInstr::Generic,
            ),
            Matcher::new("sentinel", "vvvvvvvvvvvvvvvvvvvvvvvvvvvvvvvv", |_| {
                TestInstr::Undefined
            }),
        ])
    }

    #[test]
    fn test_pattern_parse() {
        let m: Matcher<u32, ()> = Matcher::new("t", "1010vvvv1010vvvv1010vvvv1010vvvv", |_| ());
        assert_eq!(m.mask(), 0xf0f0_f0f0);
        assert_eq!(m.expected(), 0xa0a0_a0a0);
    }

    #[test]
    fn test_declaration_order_disambiguates() {
        let t = table();
        // Both rows match 0xff; the specific one is declared first
        assert_eq!(t.lookup(0xff).name(), "specific");
        assert_eq!(t.decode(0xff), TestInstr::Specific(0xff));
        // Only the generic row matches 0xfe
        assert_eq!(t.lookup(0xfe).name(), "generic");
    }

    #[test]
    fn test_sentinel_catches_everything() {
        let t = table();
        assert_eq!(t.decode(0xdead_beef), TestInstr::Undefined);
        assert_eq!(t.lookup(0xdead_beef).name(), "sentinel");
    }

    #[test]
    fn test_u16_words() {
        let t: DecodeTable<u16, bool> = DecodeTable::new(vec![
            Matcher::new("hi", "1101vvvvvvvvvvvv", |_| true),
            Matcher::new("sentinel", "vvvvvvvvvvvvvvvv", |_| false),
        ]);
        assert!(t.decode(0xd0ab));
        assert!(!t.decode(0x40ab));
    }

    #[test]
    #[should_panic]
    fn test_table_requires_sentinel() {
        let _ = DecodeTable::new(vec![Matcher::new(
            "only",
            "00000000000000000000000011111111",
            TestInstr::Specific,
        )]);
    }
}
