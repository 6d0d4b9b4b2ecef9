//! Memory access verbs shared by the boot ROM protocols that expose them.

use tracing::debug;

/// Read, write and execute in device memory.
///
/// Implemented by the SDP, FEL and SAM-BA sessions so that staging code can
/// load and start a payload without caring which ROM it is talking to.
pub trait MemoryOps {
    type Error: std::error::Error + Send + Sync + 'static;

    fn read32(&mut self, addr: u32) -> Result<u32, Self::Error>;

    fn write32(&mut self, addr: u32, value: u32) -> Result<(), Self::Error>;

    /// Write `blob[offset..offset + size]` to `addr`.
    fn write_blob(
        &mut self,
        blob: &[u8],
        addr: u32,
        offset: usize,
        size: usize,
    ) -> Result<(), Self::Error>;

    /// Start executing at `addr`.
    fn jump(&mut self, addr: u32) -> Result<(), Self::Error>;
}

/// Write a whole blob and start it, logging the first and last byte sent.
pub fn load_and_jump<M: MemoryOps + ?Sized>(
    mem: &mut M,
    blob: &[u8],
    load_addr: u32,
    entry: u32,
) -> Result<(), M::Error> {
    if let (Some(first), Some(last)) = (blob.first(), blob.last()) {
        debug!(
            addr = %format!("0x{:08x}", load_addr),
            len = blob.len(),
            "write_blob 0x{:02x}...0x{:02x}",
            first,
            last
        );
    }
    mem.write_blob(blob, load_addr, 0, blob.len())?;
    debug!(entry = %format!("0x{:08x}", entry), "jump");
    mem.jump(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Word-addressed RAM double.
    #[derive(Default)]
    struct Ram {
        words: BTreeMap<u32, u32>,
        jumped: Option<u32>,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("never")]
    struct Never;

    impl MemoryOps for Ram {
        type Error = Never;

        fn read32(&mut self, addr: u32) -> Result<u32, Never> {
            Ok(self.words.get(&addr).copied().unwrap_or(0))
        }

        fn write32(&mut self, addr: u32, value: u32) -> Result<(), Never> {
            self.words.insert(addr, value);
            Ok(())
        }

        fn write_blob(&mut self, blob: &[u8], addr: u32, offset: usize, size: usize) -> Result<(), Never> {
            for (i, w) in blob[offset..offset + size].chunks(4).enumerate() {
                let mut b = [0u8; 4];
                b[..w.len()].copy_from_slice(w);
                self.words.insert(addr + 4 * i as u32, u32::from_le_bytes(b));
            }
            Ok(())
        }

        fn jump(&mut self, addr: u32) -> Result<(), Never> {
            self.jumped = Some(addr);
            Ok(())
        }
    }

    #[test]
    fn test_load_and_jump() {
        let mut ram = Ram::default();
        load_and_jump(&mut ram, &[1, 0, 0, 0, 2, 0], 0x100, 0x104).unwrap();
        assert_eq!(ram.read32(0x100).unwrap(), 1);
        assert_eq!(ram.read32(0x104).unwrap(), 2);
        assert_eq!(ram.jumped, Some(0x104));
    }
}
