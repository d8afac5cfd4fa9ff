//! Modbus RTU wire format as observed on the gateway.
//!
//! This module holds everything that is pure byte/number manipulation: the
//! CRC-16 checksum, the frame decoder used while sniffing, the single frame
//! type we ever transmit (Write Single Register) and the register map of the
//! thermostat slaves that are polled by the external master.

use tokio_modbus::{FunctionCode, Slave, SlaveId};

/// Errors raised while converting between Rust values and register values.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum Error {
    /// The scaled setpoint does not fit into an unsigned 16-bit register.
    #[error("Setpoint {0} °C is out of range (scaled value must be 0-65535)")]
    SetpointOutOfRange(f32),

    /// The slave id is not a unicast device address.
    #[error("Slave id {0} is out of range (1-247)")]
    SlaveOutOfRange(u8),
}

/// Smallest window that can hold a frame: slave id, function code and CRC.
pub const MIN_FRAME_LEN: usize = 4;
/// Largest window tried while searching for a frame boundary.
pub const MAX_FRAME_LEN: usize = 255;

/// Payload length of a Read Coils / Read Holding Registers request.
const REQUEST_PAYLOAD_LEN: usize = 4;

pub const SLAVE_MIN: u8 = 1;
pub const SLAVE_MAX: u8 = 247;

/// Register block polled to discover a slave; temperature and humidity live at offset 2 and 3.
pub const DISCOVERY_REG_ADDR: u16 = 0x83;
pub const DISCOVERY_REG_QUAN: u16 = 4;
const DISCOVERY_TEMPERATURE_OFFSET: usize = 2;
const DISCOVERY_HUMIDITY_OFFSET: usize = 3;

pub const SETPOINT_REG_ADDR: u16 = 144;
pub const HEATING_STATUS_REG_ADDR: u16 = 211;

pub const COIL_START_ADDR: u16 = 0x01;
pub const COIL_QUAN: u16 = 40;

/// A contiguous block of holding registers read by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterRange {
    pub address: u16,
    pub quantity: u16,
}

impl RegisterRange {
    pub const fn new(address: u16, quantity: u16) -> Self {
        Self { address, quantity }
    }

    /// Returns `true` if a request for `address`/`quantity` reads exactly this range.
    pub fn matches(&self, address: u16, quantity: u16) -> bool {
        self.address == address && self.quantity == quantity
    }

    pub fn contains(&self, address: u16) -> bool {
        (self.address..self.address.saturating_add(self.quantity)).contains(&address)
    }
}

/// The holding register ranges whose responses are recorded per slave.
pub const MONITORED_RANGES: [RegisterRange; 3] = [
    RegisterRange::new(0xA5, 20), // 165-184
    RegisterRange::new(0xD2, 8),  // 210-217
    RegisterRange::new(0x8C, 23), // 140-162
];

const REGISTER_NAMES: &[(u16, &str)] = &[
    (144, "Setpoint"),
    (145, "Max Setpoint"),
    (146, "Min Setpoint"),
    (154, "Hour"),
    (155, "Minute"),
    (156, "Day of week"),
    (157, "Current temperature"),
    (179, "Outside temperature"),
    (211, "Heating status"),
];

/// Returns the human readable name of a known holding register.
pub fn register_name(address: u16) -> Option<&'static str> {
    REGISTER_NAMES
        .iter()
        .find(|(addr, _)| *addr == address)
        .map(|(_, name)| *name)
}

/// Computes the Modbus CRC-16 (reflected polynomial 0xA001, initial value 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Returns `true` if the trailing two bytes are the little-endian CRC of the rest.
pub fn check_crc(window: &[u8]) -> bool {
    if window.len() < MIN_FRAME_LEN {
        return false;
    }
    let (body, crc) = window.split_at(window.len() - 2);
    crc16(body) == u16::from_le_bytes([crc[0], crc[1]])
}

/// Appends the little-endian CRC of `frame` to it.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Builds a complete Write Single Register (0x06) frame including CRC.
pub fn build_write_single_register(slave: Slave, register: u16, value: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave.0);
    frame.push(FunctionCode::WriteSingleRegister.value());
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// What a CRC-valid window turned out to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A read request from the master.
    Request { address: u16, quantity: u16 },
    /// A Read Coils response, bit-unpacked LSB first.
    Coils(Vec<bool>),
    /// A Read Holding Registers response.
    Registers(Vec<u16>),
    /// CRC matched but the shape is not one we understand.
    Unclassified,
}

/// A CRC-validated frame taken off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub slave: SlaveId,
    pub function: FunctionCode,
    pub payload: Payload,
}

impl Frame {
    pub fn is_request(&self) -> bool {
        matches!(self.payload, Payload::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.payload, Payload::Coils(_) | Payload::Registers(_))
    }

    /// Request or response; unclassified frames are not protocol events.
    pub fn is_classified(&self) -> bool {
        self.is_request() || self.is_response()
    }
}

/// Decodes one candidate window.
///
/// Returns `None` if the window is too short or its CRC does not match. A
/// window with a valid CRC but an unknown shape is returned with
/// [`Payload::Unclassified`].
pub fn decode(window: &[u8]) -> Option<Frame> {
    if !check_crc(window) {
        return None;
    }
    let slave = window[0];
    let function = FunctionCode::new(window[1]);
    let data = &window[2..window.len() - 2];

    let payload = match function {
        FunctionCode::ReadCoils | FunctionCode::ReadHoldingRegisters
            if data.len() == REQUEST_PAYLOAD_LEN =>
        {
            Payload::Request {
                address: u16::from_be_bytes([data[0], data[1]]),
                quantity: u16::from_be_bytes([data[2], data[3]]),
            }
        }
        FunctionCode::ReadCoils if byte_counted(data) => {
            let byte_count = usize::from(data[0]);
            Payload::Coils(unpack_coils(&data[1..=byte_count]))
        }
        FunctionCode::ReadHoldingRegisters if byte_counted(data) => {
            let byte_count = usize::from(data[0]);
            Payload::Registers(
                data[1..=byte_count]
                    .chunks_exact(2)
                    .map(|word| u16::from_be_bytes([word[0], word[1]]))
                    .collect(),
            )
        }
        _ => Payload::Unclassified,
    };

    Some(Frame {
        slave,
        function,
        payload,
    })
}

/// A response payload starts with a byte count that must be covered by the data.
fn byte_counted(data: &[u8]) -> bool {
    data.len() > 1 && data.len() > usize::from(data[0])
}

fn unpack_coils(bitmap: &[u8]) -> Vec<bool> {
    bitmap
        .iter()
        .flat_map(|&byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
        .collect()
}

/// Reinterprets a raw register as two's complement.
pub fn register_to_signed(raw: u16) -> i16 {
    raw as i16
}

/// Decodes a register holding a value with one implied decimal digit.
pub fn decode_tenths(raw: u16) -> f32 {
    f32::from(raw) / 10.0
}

/// Temperature and humidity from a discovery block response.
pub fn decode_discovery(values: &[u16]) -> Option<(f32, f32)> {
    if values.len() < usize::from(DISCOVERY_REG_QUAN) {
        return None;
    }
    Some((
        decode_tenths(values[DISCOVERY_TEMPERATURE_OFFSET]),
        decode_tenths(values[DISCOVERY_HUMIDITY_OFFSET]),
    ))
}

/// Scales a setpoint in °C to the register value, rounding to one decimal.
pub fn setpoint_encode(celsius: f32) -> Result<u16, Error> {
    let scaled = (celsius * 10.0).round();
    if scaled.is_finite() && (0.0..=f32::from(u16::MAX)).contains(&scaled) {
        Ok(scaled as u16)
    } else {
        Err(Error::SetpointOutOfRange(celsius))
    }
}

/// Validates a unicast slave id for writing.
pub fn check_unicast_slave(slave: u8) -> Result<Slave, Error> {
    if (SLAVE_MIN..=SLAVE_MAX).contains(&slave) {
        Ok(Slave(slave))
    } else {
        Err(Error::SlaveOutOfRange(slave))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        append_crc(&mut frame);
        frame
    }

    #[test]
    fn crc_known_vectors() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
        assert!(check_crc(&[0x03, 0x03, 0x00, 0x83, 0x00, 0x04, 0xB4, 0x03]));
        assert!(!check_crc(&[0x03, 0x03, 0x00, 0x83, 0x00, 0x04, 0x03, 0xB4]));
        assert!(!check_crc(&[0xFF, 0xFF, 0xFF]));
    }

    #[test]
    fn crc_round_trip() {
        let mut seed = 0x1234_5678u32;
        for len in 2..=64 {
            let body: Vec<u8> = (0..len)
                .map(|_| {
                    seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                    (seed >> 16) as u8
                })
                .collect();
            let frame = with_crc(&body);
            assert!(check_crc(&frame), "body {body:02X?}");
            let decoded = decode(&frame).unwrap();
            assert_eq!(decoded.slave, body[0]);
            assert_eq!(decoded.function.value(), body[1]);
        }
    }

    #[test]
    fn crc_detects_single_bit_flips() {
        let frame = with_crc(&[0x01, 0x03, 0x02, 0x00, 0xEB]);
        for byte in 0..frame.len() - 2 {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(!check_crc(&corrupted), "flip {byte}:{bit} not detected");
            }
        }
    }

    #[test]
    fn write_single_register_frame() {
        let frame = build_write_single_register(Slave(5), SETPOINT_REG_ADDR, 215);
        assert_eq!(frame, [0x05, 0x06, 0x00, 0x90, 0x00, 0xD7, 0xC8, 0x3D]);
        assert_eq!(
            u16::from_le_bytes([frame[6], frame[7]]),
            crc16(&frame[..6])
        );
    }

    #[test]
    fn decode_rejects_short_and_corrupt_windows() {
        assert_eq!(decode(&[]), None);
        assert_eq!(decode(&[0x01, 0x03, 0x00]), None);
        let mut frame = with_crc(&[0x03, 0x03, 0x00, 0x83, 0x00, 0x04]);
        frame[3] = 0x84;
        assert_eq!(decode(&frame), None);
    }

    #[test]
    fn decode_read_requests() {
        let frame = decode(&[0x03, 0x03, 0x00, 0x83, 0x00, 0x04, 0xB4, 0x03]).unwrap();
        assert_eq!(frame.slave, 3);
        assert_eq!(frame.function, FunctionCode::ReadHoldingRegisters);
        assert_eq!(
            frame.payload,
            Payload::Request {
                address: 0x83,
                quantity: 4
            }
        );
        assert!(frame.is_request());
        assert!(!frame.is_response());

        let frame = decode(&[0x01, 0x01, 0x00, 0x01, 0x00, 0x28, 0x6D, 0xD4]).unwrap();
        assert_eq!(frame.function, FunctionCode::ReadCoils);
        assert_eq!(
            frame.payload,
            Payload::Request {
                address: COIL_START_ADDR,
                quantity: COIL_QUAN
            }
        );
    }

    #[test]
    fn decode_register_response() {
        let frame = decode(&with_crc(&[
            0x03, 0x03, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0xEB, 0x02, 0x64,
        ]))
        .unwrap();
        assert_eq!(frame.payload, Payload::Registers(vec![0, 0, 235, 612]));
        assert!(frame.is_response());
    }

    #[test]
    fn decode_register_response_drops_odd_trailing_byte() {
        let frame = decode(&with_crc(&[0x03, 0x03, 0x03, 0x00, 0x2A, 0x07, 0xFF])).unwrap();
        assert_eq!(frame.payload, Payload::Registers(vec![42]));
    }

    #[test]
    fn decode_coil_response() {
        let frame = decode(&with_crc(&[0x01, 0x01, 0x01, 0x01])).unwrap();
        assert_eq!(
            frame.payload,
            Payload::Coils(vec![true, false, false, false, false, false, false, false])
        );

        let frame = decode(&with_crc(&[0x01, 0x01, 0x02, 0x80, 0x03])).unwrap();
        let Payload::Coils(coils) = frame.payload else {
            panic!("expected coils");
        };
        assert_eq!(coils.len(), 16);
        assert!(coils[7]);
        assert!(coils[8]);
        assert!(coils[9]);
        assert_eq!(coils.iter().filter(|c| **c).count(), 3);
    }

    #[test]
    fn decode_unclassified_shapes() {
        // Write Single Register echo
        let frame = decode(&[0x05, 0x06, 0x00, 0x90, 0x00, 0xD7, 0xC8, 0x3D]).unwrap();
        assert_eq!(frame.payload, Payload::Unclassified);
        assert!(!frame.is_classified());

        // Byte count larger than the data that follows
        let frame = decode(&with_crc(&[0x03, 0x03, 0x09, 0x00, 0x01])).unwrap();
        assert_eq!(frame.payload, Payload::Unclassified);

        // No payload at all
        let frame = decode(&with_crc(&[0x03, 0x03])).unwrap();
        assert_eq!(frame.payload, Payload::Unclassified);
    }

    #[test]
    fn signed_register_conversion() {
        assert_eq!(register_to_signed(65535), -1);
        assert_eq!(register_to_signed(32768), -32768);
        assert_eq!(register_to_signed(32767), 32767);
        assert_eq!(register_to_signed(0), 0);
    }

    #[test]
    fn discovery_values() {
        assert_eq!(decode_discovery(&[0, 0, 235, 612]), Some((23.5, 61.2)));
        assert_eq!(decode_discovery(&[0, 0, 235]), None);
    }

    #[test]
    fn setpoint_encoding() {
        assert!(matches!(setpoint_encode(21.5), Ok(215)));
        assert!(matches!(setpoint_encode(0.0), Ok(0)));
        assert!(matches!(setpoint_encode(6553.5), Ok(65535)));
        assert!(matches!(setpoint_encode(19.96), Ok(200)));
        assert!(matches!(
            setpoint_encode(6553.6),
            Err(Error::SetpointOutOfRange(..))
        ));
        assert!(matches!(
            setpoint_encode(-0.5),
            Err(Error::SetpointOutOfRange(..))
        ));
        assert!(matches!(
            setpoint_encode(f32::NAN),
            Err(Error::SetpointOutOfRange(..))
        ));
    }

    #[test]
    fn unicast_slave_check() {
        assert!(matches!(
            check_unicast_slave(0),
            Err(Error::SlaveOutOfRange(0))
        ));
        assert!(matches!(check_unicast_slave(1), Ok(Slave(1))));
        assert!(matches!(check_unicast_slave(247), Ok(Slave(247))));
        assert!(matches!(
            check_unicast_slave(248),
            Err(Error::SlaveOutOfRange(248))
        ));
    }

    #[test]
    fn register_ranges_and_names() {
        assert!(MONITORED_RANGES[0].matches(165, 20));
        assert!(!MONITORED_RANGES[0].matches(165, 21));
        assert!(MONITORED_RANGES[2].contains(SETPOINT_REG_ADDR));
        assert!(MONITORED_RANGES[1].contains(HEATING_STATUS_REG_ADDR));
        assert!(!MONITORED_RANGES[1].contains(218));
        assert_eq!(register_name(SETPOINT_REG_ADDR), Some("Setpoint"));
        assert_eq!(register_name(1000), None);
    }
}
