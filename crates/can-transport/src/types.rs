use core::fmt;
use time::OffsetDateTime;

/// Maximum payload of a classic CAN frame.
pub const MAX_DATA_LEN: usize = 8;

/// 11-bit or 29-bit CAN identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CanId {
    raw: u32,
    extended: bool,
}

impl CanId {
    pub const STANDARD_MAX: u32 = 0x7FF;
    pub const EXTENDED_MAX: u32 = 0x1FFF_FFFF;

    pub fn standard(id11: u16) -> Option<Self> {
        if u32::from(id11) <= Self::STANDARD_MAX {
            Some(Self {
                raw: u32::from(id11),
                extended: false,
            })
        } else {
            None
        }
    }

    pub fn extended(id29: u32) -> Option<Self> {
        if id29 <= Self::EXTENDED_MAX {
            Some(Self {
                raw: id29,
                extended: true,
            })
        } else {
            None
        }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }
    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{raw:08X}", raw = self.raw)
        } else {
            write!(f, "0x{raw:03X}", raw = self.raw)
        }
    }
}

/// A classic CAN frame (no CAN FD)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanFrame {
    pub id: CanId,
    pub len: u8,
    pub data: [u8; 8],
    pub rtr: bool,
    pub timestamp: Option<Timestamp>,
}

impl CanFrame {
    pub fn new(id: CanId, data: &[u8]) -> Option<Self> {
        if data.len() > MAX_DATA_LEN {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            len: data.len() as u8,
            data: buf,
            rtr: false,
            timestamp: None,
        })
    }

    /// Remote transmission request carrying the given payload bytes.
    pub fn remote(id: CanId, data: &[u8]) -> Option<Self> {
        let mut frame = Self::new(id, data)?;
        frame.rtr = true;
        Some(frame)
    }

    /// Payload bytes up to the declared length; never reads past it.
    pub fn payload(&self) -> &[u8] {
        let len = usize::from(self.len).min(MAX_DATA_LEN);
        &self.data[..len]
    }

    pub fn stamped_now(mut self) -> Self {
        self.timestamp = Some(Timestamp(OffsetDateTime::now_utc()));
        self
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.id, self.len)?;
        for b in self.payload() {
            write!(f, " {b:02X}")?;
        }
        if self.rtr {
            write!(f, " (rtr)")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timestamp(pub OffsetDateTime);

/// A discovered adapter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BusInfo {
    pub name: String,
    pub driver: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_ranges() {
        assert!(CanId::standard(0x7FF).is_some());
        assert!(CanId::standard(0x800).is_none());
        assert!(CanId::extended(0x1FFF_FFFF).is_some());
        assert!(CanId::extended(0x2000_0000).is_none());
    }

    #[test]
    fn test_frame_rejects_long_payload() {
        let id = CanId::standard(0x10).unwrap();
        assert!(CanFrame::new(id, &[0u8; 9]).is_none());
        let frame = CanFrame::new(id, &[1, 2, 3]).unwrap();
        assert_eq!(frame.payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_payload_clamps_bogus_len() {
        let id = CanId::standard(0x10).unwrap();
        let mut frame = CanFrame::new(id, &[1; 8]).unwrap();
        frame.len = 15;
        assert_eq!(frame.payload().len(), 8);
    }

    #[test]
    fn test_display() {
        let id = CanId::extended(0x18FF50E5).unwrap();
        let frame = CanFrame::remote(id, &[0xAB]).unwrap();
        assert_eq!(frame.to_string(), "0x18FF50E5 [1] AB (rtr)");
    }
}
