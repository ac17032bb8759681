//! Whole-file checksum that is only valid for sequential writes

/// Running md5 over bytes written in order from offset zero.
///
/// Any write landing somewhere other than the current end of the hashed
/// stream invalidates the digest for good.
#[derive(Clone)]
pub struct RunningChecksum {
    ctx: md5::Context,
    expected_offset: u64,
    invalid: bool,
}

impl RunningChecksum {
    pub fn new() -> Self {
        RunningChecksum {
            ctx: md5::Context::new(),
            expected_offset: 0,
            invalid: false,
        }
    }

    /// Account for `data` written at `offset`, the position it actually
    /// landed at in the file
    pub fn update(&mut self, offset: u64, data: &[u8]) {
        if offset != self.expected_offset {
            self.invalid = true;
        }
        if self.invalid {
            return;
        }
        self.ctx.consume(data);
        self.expected_offset += data.len() as u64;
    }

    /// Truncation to anything but the hashed length breaks the digest
    pub fn truncate(&mut self, size: u64) {
        if size != self.expected_offset {
            self.invalid = true;
        }
    }

    pub fn invalidate(&mut self) {
        self.invalid = true;
    }

    pub fn is_valid(&self) -> bool {
        !self.invalid
    }

    pub fn expected_offset(&self) -> u64 {
        self.expected_offset
    }

    /// Hex digest of the bytes so far, empty when invalidated
    pub fn hex_digest(&self) -> String {
        if self.invalid {
            return String::new();
        }
        hex::encode(self.ctx.clone().compute().0)
    }
}

impl Default for RunningChecksum {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunningChecksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningChecksum")
            .field("expected_offset", &self.expected_offset)
            .field("invalid", &self.invalid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(data: &[u8]) -> String {
        format!("{:x}", md5::compute(data))
    }

    #[test]
    fn test_sequential_writes_stay_valid() {
        let mut sum = RunningChecksum::new();
        sum.update(0, b"hello");
        sum.update(5, b" worl");
        sum.update(10, b"d");
        assert!(sum.is_valid());
        assert_eq!(sum.expected_offset(), 11);
        assert_eq!(sum.hex_digest(), digest(b"hello world"));
    }

    #[test]
    fn test_out_of_order_write_invalidates_for_good() {
        let mut sum = RunningChecksum::new();
        sum.update(5, b"world");
        sum.update(0, b"hello");
        assert!(!sum.is_valid());
        assert_eq!(sum.hex_digest(), "");

        // writing the "right" offset afterwards does not recover it
        sum.update(10, b"!");
        assert_eq!(sum.hex_digest(), "");
    }

    #[test]
    fn test_overlapping_write_invalidates() {
        let mut sum = RunningChecksum::new();
        sum.update(0, b"ab");
        sum.update(0, b"cd");
        assert_eq!(sum.hex_digest(), "");
    }

    #[test]
    fn test_truncate() {
        let mut sum = RunningChecksum::new();
        sum.update(0, b"abc");
        sum.truncate(3);
        assert!(sum.is_valid());
        sum.truncate(1);
        assert!(!sum.is_valid());
    }

    #[test]
    fn test_empty_file_digest() {
        assert_eq!(RunningChecksum::new().hex_digest(), digest(b""));
    }
}
