//! Byte signatures with optional wildcard positions.

use std::fmt;

/// A byte signature.  `None` positions match any byte.
#[derive(Clone, PartialEq, Eq)]
pub struct BytePattern {
    bytes: Vec<Option<u8>>,
}

impl BytePattern {
    pub fn exact(bytes: &[u8]) -> Self {
        Self { bytes: bytes.iter().copied().map(Some).collect() }
    }

    /// Parse whitespace-separated hex pairs; `??` is a wildcard.
    ///
    /// ```
    /// # use binscan::format::BytePattern;
    /// let jpeg = BytePattern::from_hex("FF D8 FF ??").unwrap();
    /// assert!(jpeg.matches_prefix(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]));
    /// ```
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = Vec::new();
        for tok in s.split_whitespace() {
            if tok == "??" {
                bytes.push(None);
                continue;
            }
            let mut b = [0u8; 1];
            hex::decode_to_slice(tok, &mut b)?;
            bytes.push(Some(b[0]));
        }
        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn matches_at(&self, window: &[u8]) -> bool {
        window.len() == self.bytes.len()
            && self.bytes.iter().zip(window).all(|(p, b)| p.map_or(true, |p| p == *b))
    }

    /// Does `window` start with this pattern?
    pub fn matches_prefix(&self, window: &[u8]) -> bool {
        window.len() >= self.len() && self.matches_at(&window[..self.len()])
    }

    /// Does `window` end with this pattern?
    pub fn matches_suffix(&self, window: &[u8]) -> bool {
        window.len() >= self.len() && self.matches_at(&window[window.len() - self.len()..])
    }
}

impl fmt::Debug for BytePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.bytes
            .iter()
            .map(|b| b.map_or_else(|| "??".to_owned(), |b| format!("{b:02X}")))
            .collect();
        write!(f, "BytePattern({})", parts.join(" "))
    }
}
