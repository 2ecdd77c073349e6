pub mod admission;
pub mod map;
pub mod region;

pub use map::Interconnect;
pub use region::{resolve, Region};

/// Fault raised by the bus itself.
///
/// These are host-level failures (a hole in the memory map, a device
/// asked for bytes it does not own), never guest exceptions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("no device mapped at physical address {0:#010X}")]
    Unmapped(u32),

    #[error("{device}: {len}-byte access at offset {offset:#X} falls outside the device")]
    OutOfRange {
        device: &'static str,
        offset: u32,
        len: u32,
    },

    #[error("{device}: register layout rejected at offset {offset:#X}")]
    Layout { device: &'static str, offset: u32 },

    #[error("DMA copy aborted after {count} bytes")]
    MemoryCopy {
        count: u32,
        #[source]
        source: Box<BusError>,
    },
}

/// How a bus access is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// The whole span belongs to one device.
    Aligned,
    /// Walk byte by byte, re-resolving the owning device for each byte.
    Unaligned,
}

/// Block copy between two physical addresses, used by DMA engines.
///
/// Handed to device post-write hooks while the bus is already held for
/// writing, so implementations must not re-enter reader admission.
pub trait DmaPort {
    /// Copy `len` bytes from `src` to `dst`. Returns the byte count moved.
    fn copy(&self, src: u32, dst: u32, len: u32) -> Result<u32, BusError>;
}

/// A device occupying one region of the physical address space.
///
/// Offsets are region-relative. Devices keep their state behind their own
/// lock so the bus can be shared with a DMA or input thread.
pub trait Device: Send + Sync {
    fn name(&self) -> &'static str;

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), BusError>;

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), BusError>;

    /// Called by the bus right after a successful `write` of `len` bytes at
    /// `offset`. Register side effects (DMA kicks, interrupt acks) live here.
    fn post_write(&self, _offset: u32, _len: u32, _dma: &dyn DmaPort) -> Result<(), BusError> {
        Ok(())
    }
}

/// Memory bus as seen by the CPU.
///
/// All CPU memory traffic goes through this trait. Values are big-endian,
/// matching the VR4300's bus byte order. Physical addresses are 32-bit;
/// the CPU resolves 64-bit virtual addresses before calling in.
pub trait Bus {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), BusError>;

    fn write(&self, addr: u32, data: &[u8]) -> Result<(), BusError>;

    /// Drain RDRAM ranges written since the last call. The recompiler uses
    /// these to drop blocks whose code was overwritten.
    fn take_code_writes(&self) -> Vec<(u32, u32)> {
        Vec::new()
    }

    fn read_u8(&self, addr: u32) -> Result<u8, BusError> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u32) -> Result<u16, BusError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32(&self, addr: u32) -> Result<u32, BusError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64(&self, addr: u32) -> Result<u64, BusError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn write_u8(&self, addr: u32, val: u8) -> Result<(), BusError> {
        self.write(addr, &[val])
    }

    fn write_u16(&self, addr: u32, val: u16) -> Result<(), BusError> {
        self.write(addr, &val.to_be_bytes())
    }

    fn write_u32(&self, addr: u32, val: u32) -> Result<(), BusError> {
        self.write(addr, &val.to_be_bytes())
    }

    fn write_u64(&self, addr: u32, val: u64) -> Result<(), BusError> {
        self.write(addr, &val.to_be_bytes())
    }
}
