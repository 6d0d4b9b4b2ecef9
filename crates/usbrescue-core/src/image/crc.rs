//! Table driven CRCs that `crc32fast` does not cover.

const fn crc16_table(poly: u16) -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn crc32_msb_table(poly: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC16_CCITT: [u16; 256] = crc16_table(0x1021);
static CRC32_ROCKCHIP: [u32; 256] = crc32_msb_table(0x04c1_0db7);

/// CRC-16/CCITT-FALSE (also known as CRC-16/IBM-3740).
#[derive(Debug, Clone, Copy)]
pub struct Crc16 {
    state: u16,
}

impl Crc16 {
    pub fn new() -> Self {
        Self { state: 0xffff }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            let idx = ((self.state >> 8) as u8 ^ b) as usize;
            self.state = (self.state << 8) ^ CRC16_CCITT[idx];
        }
    }

    pub fn finish(&self) -> u16 {
        self.state
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-32/ROCKCHIP: polynomial 0x04c10db7, zero init, unreflected.
pub fn crc32_rockchip(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, &b| {
        let idx = ((crc >> 24) as u8 ^ b) as usize;
        (crc << 8) ^ CRC32_ROCKCHIP[idx]
    })
}
