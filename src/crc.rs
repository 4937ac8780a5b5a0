//! Table-driven CRC-16 used for the data frame trailer.
//!
//! Reflected CRC-16/ARC, polynomial 0xA001, zero init. [`Crc16::end`]
//! presents the result with its two bytes swapped, so the trailer goes on
//! the wire high byte first and recomputing over `payload ++ terminator ++
//! trailer` yields residue zero.

const POLYNOMIAL: u16 = 0xA001;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut value = 0u16;
        let mut temp = i as u16;
        let mut j = 0;
        while j < 8 {
            if ((value ^ temp) & 0x0001) != 0 {
                value = (value >> 1) ^ POLYNOMIAL;
            } else {
                value >>= 1;
            }
            temp >>= 1;
            j += 1;
        }
        table[i] = value;
        i += 1;
    }
    table
}

static TABLE: [u16; 256] = build_table();

/// Incremental CRC-16 engine. One instance lives in the dispatcher; the
/// stateless [`compute`](Crc16::compute) form serves validation paths.
#[derive(Debug, Default)]
pub struct Crc16 {
    state: u16,
}

impl Crc16 {
    pub fn new() -> Crc16 {
        Crc16 { state: 0 }
    }

    /// Reset the internal state for a new computation.
    pub fn init(&mut self) {
        self.state = 0;
    }

    /// Fold one byte into the running checksum.
    pub fn update(&mut self, byte: u8) {
        let index = (self.state ^ u16::from(byte)) & 0xFF;
        self.state = (self.state >> 8) ^ TABLE[index as usize];
    }

    /// Fold a slice into the running checksum.
    pub fn update_slice(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.update(*byte);
        }
    }

    /// Finish the computation, returning the byte-swapped presentation.
    pub fn end(&self) -> u16 {
        self.state.swap_bytes()
    }

    /// Stateless convenience form: init, update, end.
    pub fn compute(&mut self, bytes: &[u8]) -> u16 {
        self.init();
        self.update_slice(bytes);
        self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::Crc16;

    #[test]
    fn check_value() {
        // CRC-16/ARC("123456789") is 0xBB3D; byte-swapped presentation.
        let mut crc = Crc16::new();
        assert_eq!(crc.compute(b"123456789"), 0x3DBB);
    }

    #[test]
    fn incremental_matches_stateless() {
        let data = [0x01u8, 0x10, 0xFF, 0x42, 0x00, 0x99];
        let mut crc = Crc16::new();
        let stateless = crc.compute(&data);

        crc.init();
        for byte in &data {
            crc.update(*byte);
        }
        assert_eq!(crc.end(), stateless);

        // Same input twice, same value.
        assert_eq!(crc.compute(&data), stateless);
    }

    #[test]
    fn init_resets_state() {
        let mut crc = Crc16::new();
        crc.update_slice(b"garbage");
        crc.init();
        assert_eq!(crc.end(), 0);
        assert_eq!(crc.compute(b"123456789"), 0x3DBB);
    }

    #[test]
    fn appended_trailer_yields_zero_residue() {
        let mut crc = Crc16::new();
        for payload in [&b"hello"[..], &[0x10, 0x10, 0x03][..], &[][..]] {
            let mut block = payload.to_vec();
            block.push(0x03); // frame terminator joins the checksum
            let sum = crc.compute(&block);
            block.push((sum >> 8) as u8);
            block.push((sum & 0xFF) as u8);
            assert_eq!(crc.compute(&block), 0);
        }
    }
}
