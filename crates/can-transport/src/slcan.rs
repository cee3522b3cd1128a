use crate::{BusInfo, CanBus, CanDriver, CanFrame, CanId, Result, TransportError};
use serialport::{SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::debug;

/// Discovery of SLCAN adapters (USB serial dongles speaking the Lawicel text protocol).
#[derive(Clone, Debug, Default)]
pub struct SlcanDriver;

impl CanDriver for SlcanDriver {
    fn name(&self) -> &str {
        "slcan"
    }

    fn scan(&self) -> Result<Vec<BusInfo>> {
        let ports = serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(ports
            .into_iter()
            .filter(|p| matches!(p.port_type, SerialPortType::UsbPort(_)))
            .map(|p| BusInfo {
                name: p.port_name,
                driver: "slcan-serial".to_string(),
            })
            .collect())
    }

    fn open(&self, info: &BusInfo) -> Result<Box<dyn CanBus>> {
        Ok(Box::new(SlcanBus::open(&info.name)?))
    }
}

/// SLCAN text protocol over serial
pub struct SlcanBus {
    port_path: String,
    port: Box<dyn SerialPort>,
    acc: Vec<u8>,
    open: bool,
}

impl SlcanBus {
    /// Open the serial port and close the channel so it can be configured.
    pub fn open(path: &str) -> Result<Self> {
        let mut port = serialport::new(path, 115200)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        // A previous session may have left the channel open
        let _ = Self::write_cmd(&mut *port, b"C\r");
        Ok(SlcanBus {
            port_path: path.to_string(),
            port,
            acc: Vec::with_capacity(64),
            open: false,
        })
    }

    fn encode_frame(frame: &CanFrame) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(32);
        if frame.len > 8 {
            return Err(TransportError::InvalidFrame("dlc > 8"));
        }
        let kind = match (frame.id.is_extended(), frame.rtr) {
            (true, false) => b'T',
            (true, true) => b'R',
            (false, false) => b't',
            (false, true) => b'r',
        };
        out.push(kind);
        if frame.id.is_extended() {
            out.extend_from_slice(format!("{:08X}", frame.id.raw()).as_bytes());
        } else {
            out.extend_from_slice(format!("{:03X}", frame.id.raw()).as_bytes());
        }
        out.push(b'0' + frame.len);
        if !frame.rtr {
            for b in frame.payload() {
                out.extend_from_slice(format!("{b:02X}").as_bytes());
            }
        }
        out.push(b'\r');
        Ok(out)
    }

    fn parse_frame(line: &[u8]) -> Result<CanFrame> {
        let (&kind, rest) = line
            .split_first()
            .ok_or(TransportError::InvalidFrame("empty"))?;
        let (id_len, extended, rtr) = match kind {
            b't' => (3, false, false),
            b'r' => (3, false, true),
            b'T' => (8, true, false),
            b'R' => (8, true, true),
            _ => return Err(TransportError::InvalidFrame("unknown header")),
        };
        if rest.len() < id_len + 1 {
            return Err(TransportError::InvalidFrame("short header"));
        }
        let raw = u32::from_str_radix(Self::ascii(&rest[..id_len])?, 16)
            .map_err(|_| TransportError::InvalidFrame("id"))?;
        let id = if extended {
            CanId::extended(raw)
        } else {
            u16::try_from(raw).ok().and_then(CanId::standard)
        }
        .ok_or(TransportError::InvalidFrame("id range"))?;
        let dlc = rest[id_len].wrapping_sub(b'0');
        if dlc > 8 {
            return Err(TransportError::InvalidFrame("dlc > 8"));
        }
        let mut data = [0u8; 8];
        if !rtr {
            let hex = &rest[id_len + 1..];
            if hex.len() < usize::from(dlc) * 2 {
                return Err(TransportError::InvalidFrame("short data"));
            }
            for (i, slot) in data.iter_mut().take(usize::from(dlc)).enumerate() {
                *slot = u8::from_str_radix(Self::ascii(&hex[i * 2..i * 2 + 2])?, 16)
                    .map_err(|_| TransportError::InvalidFrame("byte"))?;
            }
        }
        Ok(CanFrame {
            id,
            len: dlc,
            data,
            rtr,
            timestamp: None,
        }
        .stamped_now())
    }

    fn ascii(bytes: &[u8]) -> Result<&str> {
        std::str::from_utf8(bytes).map_err(|_| TransportError::InvalidFrame("utf8"))
    }

    fn write_cmd(port: &mut dyn SerialPort, cmd: &[u8]) -> Result<()> {
        port.write_all(cmd)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }
}

impl CanBus for SlcanBus {
    fn set_bitrate(&mut self, bitrate: u32) -> Result<()> {
        let code = SlcanBitrate::from_bps(bitrate)
            .ok_or(TransportError::BitrateRejected(bitrate))?
            .code();
        Self::write_cmd(&mut *self.port, &[b'S', code, b'\r'])
    }

    fn start(&mut self) -> Result<()> {
        Self::write_cmd(&mut *self.port, b"O\r")?;
        self.open = true;
        debug!(port = %self.port_path, "slcan channel open");
        Ok(())
    }

    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame> {
        if !self.open {
            return Err(TransportError::NotStarted);
        }
        if let Some(ms) = timeout_ms {
            self.port.set_timeout(Duration::from_millis(ms)).ok();
        }
        let line = read_frame_line(&mut self.acc, &mut self.port)?;
        Self::parse_frame(&line)
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        if !self.open {
            return Err(TransportError::NotStarted);
        }
        let line = Self::encode_frame(frame)?;
        self.port
            .write_all(&line)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.acc.clear();
        Self::write_cmd(&mut *self.port, b"C\r")
    }
}

/// Supported SLCAN bitrates (mapped to Sx codes)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlcanBitrate {
    B10k,  // S0
    B20k,  // S1
    B50k,  // S2
    B100k, // S3
    B125k, // S4
    B250k, // S5
    B500k, // S6
    B800k, // S7
    B1M,   // S8
}

impl SlcanBitrate {
    pub fn from_bps(bps: u32) -> Option<Self> {
        Some(match bps {
            10_000 => SlcanBitrate::B10k,
            20_000 => SlcanBitrate::B20k,
            50_000 => SlcanBitrate::B50k,
            100_000 => SlcanBitrate::B100k,
            125_000 => SlcanBitrate::B125k,
            250_000 => SlcanBitrate::B250k,
            500_000 => SlcanBitrate::B500k,
            800_000 => SlcanBitrate::B800k,
            1_000_000 => SlcanBitrate::B1M,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        match self {
            SlcanBitrate::B10k => b'0',
            SlcanBitrate::B20k => b'1',
            SlcanBitrate::B50k => b'2',
            SlcanBitrate::B100k => b'3',
            SlcanBitrate::B125k => b'4',
            SlcanBitrate::B250k => b'5',
            SlcanBitrate::B500k => b'6',
            SlcanBitrate::B800k => b'7',
            SlcanBitrate::B1M => b'8',
        }
    }
}

/// Next frame line from the adapter, without its CR. Partial lines stay buffered in `acc`
/// across calls.
fn read_frame_line<R: Read + ?Sized>(acc: &mut Vec<u8>, port: &mut R) -> Result<Vec<u8>> {
    let mut buf = [0u8; 128];
    loop {
        if let Some(pos) = acc.iter().position(|&b| b == b'\r') {
            let mut line: Vec<u8> = acc.drain(..=pos).collect();
            line.pop();
            // Bare CR acknowledges a command; BEL reports a failed one
            if line.is_empty() || line == [0x07] {
                continue;
            }
            return Ok(line);
        }
        match port.read(&mut buf) {
            Ok(n) if n > 0 => acc.extend_from_slice(&buf[..n]),
            // A zero-length read means nothing arrived in time
            Ok(_) => return Err(TransportError::Timeout),
            Err(e) if e.kind() == ErrorKind::TimedOut => return Err(TransportError::Timeout),
            Err(e) => return Err(TransportError::Io(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate_codes() {
        assert_eq!(SlcanBitrate::from_bps(250_000).map(|b| b.code()), Some(b'5'));
        assert_eq!(SlcanBitrate::from_bps(1_000_000).map(|b| b.code()), Some(b'8'));
        assert!(SlcanBitrate::from_bps(333_333).is_none());
    }

    #[test]
    fn test_encode_extended_frame() {
        let id = CanId::extended(0x18FF50E5).unwrap();
        let frame = CanFrame::new(id, &[0xDE, 0xAD]).unwrap();
        let line = SlcanBus::encode_frame(&frame).unwrap();
        assert_eq!(line, b"T18FF50E52DEAD\r");
    }

    #[test]
    fn test_encode_remote_frame_has_no_data() {
        let id = CanId::standard(0x123).unwrap();
        let frame = CanFrame::remote(id, &[0, 0]).unwrap();
        assert_eq!(SlcanBus::encode_frame(&frame).unwrap(), b"r1232\r");
    }

    #[test]
    fn test_parse_standard_frame() {
        let frame = SlcanBus::parse_frame(b"t1233DEADBE").unwrap();
        assert_eq!(frame.id, CanId::standard(0x123).unwrap());
        assert_eq!(frame.payload(), &[0xDE, 0xAD, 0xBE]);
        assert!(!frame.rtr);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SlcanBus::parse_frame(b"x123").is_err());
        assert!(SlcanBus::parse_frame(b"t1239").is_err());
        assert!(SlcanBus::parse_frame(b"t1232AB").is_err());
        assert!(SlcanBus::parse_frame(b"t8001AB").is_err());
    }

    #[test]
    fn test_read_line_skips_acks_and_keeps_partial_lines() {
        let mut acc = Vec::new();
        let mut port: &[u8] = b"\r\x07\rt1232AB\rt45";
        assert_eq!(read_frame_line(&mut acc, &mut port).unwrap(), b"t1232AB");
        // The partial tail stays buffered; the drained port reads zero bytes
        assert!(read_frame_line(&mut acc, &mut port).unwrap_err().is_timeout());
        assert_eq!(acc, b"t45");
    }

    #[test]
    fn test_read_line_times_out_on_empty_read() {
        let mut acc = Vec::new();
        let mut port = std::io::empty();
        assert!(read_frame_line(&mut acc, &mut port).unwrap_err().is_timeout());
    }
}
