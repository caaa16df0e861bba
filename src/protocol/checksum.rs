//! CRC-32 (IEEE 802.3, reflected polynomial 0xEDB88320) frame trailer

const POLY: u32 = 0xEDB8_8320;

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static TABLE: [u32; 256] = build_table();

/// Incremental CRC-32 computation
#[derive(Debug, Clone, Copy)]
pub struct Crc32 {
    value: u32,
}

impl Crc32 {
    pub fn new() -> Self {
        Self { value: 0xFFFF_FFFF }
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.value;
        for &byte in data {
            crc = TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
        }
        self.value = crc;
    }

    pub fn finalize(&self) -> u32 {
        self.value ^ 0xFFFF_FFFF
    }

    /// Compute the CRC of an entire buffer in one call
    pub fn compute(data: &[u8]) -> u32 {
        let mut crc = Self::new();
        crc.update(data);
        crc.finalize()
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(Crc32::compute(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut crc = Crc32::new();
        crc.update(b"Hello, ");
        crc.update(b"world!");
        assert_eq!(crc.finalize(), Crc32::compute(b"Hello, world!"));
        assert_eq!(crc.finalize(), 0xEBE6_C6E6);
    }

    #[test]
    fn test_empty() {
        assert_eq!(Crc32::compute(&[]), 0);
    }
}
