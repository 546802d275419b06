//! Sensor Data Repository record decoding.
//!
//! Covers the record types a remote client meets in practice: full and
//! compact sensors, event-only sensors, FRU and management-controller
//! locators, entity associations and the OEM escape. Numeric conversion
//! implements the full-sensor formula `(raw·M + B) · 10^K` with the eleven
//! linearization functions; linearization 0x70 and up means the factors
//! must be fetched from the BMC per reading (Get Sensor Reading Factors).

use std::fmt;

/// The only SDR version defined at the time of writing.
pub const SDR_VERSION: u8 = 0x51;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Why a record (or device response) failed to decode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// The record declares an SDR version other than 0x51.
    UnsupportedVersion(u8),
    /// The record or response is shorter than its type requires.
    Truncated,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVersion(v) => write!(f, "unsupported SDR version {v:#04x}"),
            Self::Truncated => write!(f, "record data truncated"),
        }
    }
}

impl std::error::Error for DecodeError {}

// ─── Two's / one's complement helpers ────────────────────────────────────────

fn twos_complement(value: u32, bits: u32) -> i32 {
    let signbit = 1u32 << (bits - 1);
    if value & signbit != 0 {
        -(((value.wrapping_sub(1)) ^ ((1 << bits) - 1)) as i32)
    } else {
        value as i32
    }
}

fn ones_complement(value: u32, bits: u32) -> i32 {
    let signbit = 1u32 << (bits - 1);
    if value & signbit != 0 {
        -((value ^ ((1 << bits) - 1)) as i32)
    } else {
        value as i32
    }
}

// ─── Unit tables (table 43-15) ───────────────────────────────────────────────

/// Sensor base/modifier unit text.
pub fn unit_text(code: u8) -> &'static str {
    match code {
        1 => "°C",
        2 => "°F",
        3 => "K",
        4 => "V",
        5 => "A",
        6 => "W",
        7 => "J",
        8 => "C",
        9 => "VA",
        10 => "nt",
        11 => "lm",
        12 => "lx",
        13 => "cd",
        14 => "kPa",
        15 => "PSI",
        16 => "N",
        17 => "CFM",
        18 => "RPM",
        19 => "Hz",
        20 => "μs",
        21 => "ms",
        22 => "s",
        23 => "min",
        24 => "hr",
        25 => "d",
        26 => "week(s)",
        27 => "mil",
        28 => "inches",
        29 => "ft",
        30 => "cu in",
        31 => "cu feet",
        32 => "mm",
        33 => "cm",
        34 => "m",
        35 => "cu cm",
        36 => "cu m",
        37 => "L",
        38 => "fl. oz.",
        39 => "radians",
        40 => "steradians",
        41 => "revolutions",
        42 => "cycles",
        43 => "g",
        44 => "ounce",
        45 => "lb",
        46 => "ft-lb",
        47 => "oz-in",
        48 => "gauss",
        49 => "gilberts",
        50 => "henry",
        51 => "millihenry",
        52 => "farad",
        53 => "microfarad",
        54 => "ohms",
        55 => "siemens",
        56 => "mole",
        57 => "becquerel",
        58 => "ppm",
        60 => "dB",
        61 => "dBA",
        62 => "dBC",
        63 => "Gy",
        64 => "sievert",
        65 => "color temp deg K",
        66 => "bit",
        67 => "kb",
        68 => "mb",
        69 => "gb",
        70 => "byte",
        71 => "kB",
        72 => "mB",
        73 => "gB",
        74 => "word",
        75 => "dword",
        76 => "qword",
        77 => "line",
        78 => "hit",
        79 => "miss",
        80 => "retry",
        81 => "reset",
        82 => "overrun/overflow",
        83 => "underrun",
        84 => "collision",
        85 => "packets",
        86 => "messages",
        87 => "characters",
        88 => "error",
        89 => "uncorrectable error",
        90 => "correctable error",
        91 => "fatal error",
        92 => "grams",
        _ => "",
    }
}

fn rate_text(code: u8) -> &'static str {
    match code {
        1 => " per us",
        2 => " per ms",
        3 => " per s",
        4 => " per minute",
        5 => " per hour",
        6 => " per day",
        _ => "",
    }
}

// ─── Type/length-value names ─────────────────────────────────────────────────

/// Decode an IPMI type/length-prefixed name.
pub fn tlv_decode(tlv: u8, data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    match (tlv & 0b1100_0000) >> 6 {
        0 => String::from_utf8_lossy(data).into_owned(),
        1 => {
            // BCD plus: nibbles render as digits with punctuation escapes.
            let mut out = String::with_capacity(data.len() * 2);
            for b in data {
                for nibble in [b >> 4, b & 0xf] {
                    out.push(match nibble {
                        0..=9 => (b'0' + nibble) as char,
                        0xa => ' ',
                        0xb => '-',
                        0xc => '.',
                        0xd => ':',
                        0xe => ',',
                        _ => '_',
                    });
                }
            }
            out
        }
        2 => {
            // 6-bit packed ASCII, three bytes to four characters.
            let mut out = String::new();
            let mut chunks = data.chunks_exact(3);
            for c in &mut chunks {
                out.push(((c[0] & 0x3f) + 0x20) as char);
                out.push((((c[1] & 0xf) << 2) + (c[0] >> 6) + 0x20) as char);
                out.push((((c[2] & 0x3) << 4) + (c[1] >> 4) + 0x20) as char);
                out.push(((c[2] >> 2) + 0x20) as char);
            }
            out
        }
        _ => String::from_utf8_lossy(data).into_owned(),
    }
}

// ─── Reading factors ─────────────────────────────────────────────────────────

/// Conversion factors from a full-sensor record or a Get Sensor Reading
/// Factors response.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReadingFactors {
    /// Multiplier M (10-bit two's complement).
    pub m: i32,
    /// Tolerance in ± half raw counts.
    pub tolerance: u8,
    /// Offset B with its exponent already applied.
    pub b: f64,
    /// Accuracy field, table 43-1 encoding preserved.
    pub accuracy: u32,
    /// Accuracy exponent.
    pub accuracy_exp: u8,
    /// 0 n/a, 1 input, 2 output.
    pub direction: u8,
    /// Result exponent K2 (4-bit two's complement).
    pub result_exp: i32,
}

impl Default for ReadingFactors {
    /// Identity conversion, used where a record carries no factors.
    fn default() -> Self {
        Self {
            m: 1,
            tolerance: 0,
            b: 0.0,
            accuracy: 0,
            accuracy_exp: 0,
            direction: 0,
            result_exp: 0,
        }
    }
}

impl ReadingFactors {
    /// Decode the six factor bytes (record bytes 19..25, or response data
    /// after the next-reading byte).
    pub fn decode(entry: &[u8]) -> Result<Self, DecodeError> {
        if entry.len() < 6 {
            return Err(DecodeError::Truncated);
        }
        let m = twos_complement(entry[0] as u32 + (((entry[1] & 0b1100_0000) as u32) << 2), 10);
        let tolerance = entry[1] & 0b11_1111;
        let b_raw = twos_complement(entry[2] as u32 + (((entry[3] & 0b1100_0000) as u32) << 2), 10);
        let accuracy = (((entry[3] & 0b11_1111) as u32) + ((entry[4] & 0b1111_0000) as u32)) << 2;
        let accuracy_exp = (entry[4] & 0b1100) >> 2;
        let direction = entry[4] & 0b11;
        let result_exp = twos_complement(((entry[5] & 0b1111_0000) >> 4) as u32, 4);
        let b_exp = twos_complement((entry[5] & 0b1111) as u32, 4);
        Ok(Self {
            m,
            tolerance,
            b: b_raw as f64 * 10f64.powi(b_exp),
            accuracy,
            accuracy_exp,
            direction,
            result_exp,
        })
    }
}

/// Apply linearization 0..=11 to a converted value.
pub fn linearize(linearization: u8, value: f64) -> Option<f64> {
    Some(match linearization {
        0 => value,
        1 => value.ln(),
        2 => value.log10(),
        3 => value.log2(),
        4 => value.exp(),
        5 => 10f64.powf(value),
        6 => 2f64.powf(value),
        7 => 1.0 / value,
        8 => value * value,
        9 => value * value * value,
        10 => value.sqrt(),
        11 => value.cbrt(),
        _ => return None,
    })
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// The five-byte record header returned ahead of every Get SDR chunk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordHeader {
    /// Record id within the repository.
    pub record_id: u16,
    /// SDR version (must be 0x51).
    pub version: u8,
    /// Record type byte.
    pub rectype: u8,
    /// Remaining body length after the header.
    pub body_len: u8,
}

impl RecordHeader {
    /// Parse the header from the first five record bytes.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 5 {
            return Err(DecodeError::Truncated);
        }
        Ok(Self {
            record_id: u16::from_le_bytes([data[0], data[1]]),
            version: data[2],
            rectype: data[3],
            body_len: data[4],
        })
    }
}

/// A sensor-ish record (full, compact or event-only).
#[derive(Clone, Debug, PartialEq)]
pub struct SensorRecord {
    /// Owner (slave address or software id).
    pub owner: u8,
    /// Sensor LUN.
    pub lun: u8,
    /// Sensor number.
    pub number: u8,
    /// Entity id byte.
    pub entity_id: u8,
    /// Sensor type code (table 42-3).
    pub sensor_type: u8,
    /// Event/reading type code (table 42-1).
    pub reading_type: u8,
    /// Decoded sensor name.
    pub name: String,
    /// Event-only sensors cannot be read.
    pub readable: bool,
    /// Full sensors with threshold support.
    pub has_thresholds: bool,
    /// 0 unsigned, 1 one's complement, 2 two's complement, 3 no numeric.
    pub numeric_format: u8,
    /// Assembled unit suffix (percent, base, modifier).
    pub unit_suffix: String,
    /// Rate annotation (" per s" etc.).
    pub rate: &'static str,
    /// Linearization code; > 11 means fetch factors per reading.
    pub linearization: u8,
    /// Static factors, present on linear full sensors.
    pub factors: Option<ReadingFactors>,
    /// Manufacturer id carried for OEM reading-type lookups.
    pub mfg_id: u32,
    /// Product id carried for OEM reading-type lookups.
    pub prod_id: u16,
}

/// A FRU device locator record.
#[derive(Clone, Debug, PartialEq)]
pub struct FruLocator {
    /// Decoded FRU name.
    pub name: String,
    /// FRU device id.
    pub number: u8,
    /// Logical (true) vs physical device.
    pub logical: bool,
    /// Device type and modifier, packed as the record gives them.
    pub type_and_modifier: u16,
}

/// One decoded SDR record.
#[derive(Clone, Debug, PartialEq)]
pub enum SdrRecord {
    /// Type 1: full sensor with conversion factors.
    FullSensor(SensorRecord),
    /// Type 2: compact (discrete) sensor.
    CompactSensor(SensorRecord),
    /// Type 3: event-only sensor.
    EventOnlySensor(SensorRecord),
    /// Type 8: entity association (not represented further).
    EntityAssociation,
    /// Type 0x11: FRU device locator.
    FruLocator(FruLocator),
    /// Type 0x12: management controller locator.
    McLocator,
    /// Type 0xC0: OEM record.
    Oem {
        /// The record's manufacturer id.
        mfg_id: u32,
    },
    /// Anything else.
    Unknown {
        /// The unrecognized record type byte.
        rectype: u8,
    },
}

impl SdrRecord {
    /// Decode a whole record (header plus body).
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_with_ids(bytes, 0, 0)
    }

    /// Decode, stamping manufacturer/product ids onto sensor records for
    /// OEM reading-type interpretation downstream.
    pub fn decode_with_ids(bytes: &[u8], mfg_id: u32, prod_id: u16) -> Result<Self, DecodeError> {
        let header = RecordHeader::parse(bytes)?;
        if header.version != SDR_VERSION {
            return Err(DecodeError::UnsupportedVersion(header.version));
        }
        let body = &bytes[5..];
        Ok(match header.rectype {
            1 => Self::FullSensor(decode_sensor(body, 1, mfg_id, prod_id)?),
            2 => Self::CompactSensor(decode_sensor(body, 2, mfg_id, prod_id)?),
            3 => Self::EventOnlySensor(decode_sensor(body, 3, mfg_id, prod_id)?),
            8 => Self::EntityAssociation,
            0x11 => Self::FruLocator(decode_fru(body)?),
            0x12 => Self::McLocator,
            0xc0 => {
                if body.len() < 3 {
                    return Err(DecodeError::Truncated);
                }
                Self::Oem {
                    mfg_id: body[0] as u32 | (body[1] as u32) << 8 | (body[2] as u32) << 16,
                }
            }
            other => {
                log::debug!("unrecognized SDR record type {other:#04x}");
                Self::Unknown { rectype: other }
            }
        })
    }

    /// The sensor record, when this is one.
    pub fn sensor(&self) -> Option<&SensorRecord> {
        match self {
            Self::FullSensor(s) | Self::CompactSensor(s) | Self::EventOnlySensor(s) => Some(s),
            _ => None,
        }
    }

    /// The sensor map key `{owner}.{number}.{lun}`.
    pub fn sensor_key(&self) -> Option<String> {
        self.sensor()
            .map(|s| format!("{}.{}.{}", s.owner, s.number, s.lun))
    }
}

fn decode_sensor(
    body: &[u8],
    rectype: u8,
    mfg_id: u32,
    prod_id: u16,
) -> Result<SensorRecord, DecodeError> {
    let need = match rectype {
        1 => 43,
        2 => 27,
        _ => 12,
    };
    if body.len() < need {
        return Err(DecodeError::Truncated);
    }

    let owner = body[0];
    let lun = body[1] & 0x03;
    let number = body[2];
    let entity_id = body[3];
    let (sensor_type, reading_type) = if rectype == 3 {
        (body[5], body[6])
    } else {
        (body[7], body[8])
    };
    let has_thresholds = rectype == 1 && body[6] & 0b0000_1100 != 0;

    if rectype == 3 {
        return Ok(SensorRecord {
            owner,
            lun,
            number,
            entity_id,
            sensor_type,
            reading_type,
            name: tlv_decode(body[11], &body[12..]),
            readable: false,
            has_thresholds: false,
            numeric_format: 3,
            unit_suffix: String::new(),
            rate: "",
            linearization: 0,
            factors: None,
            mfg_id,
            prod_id,
        });
    }

    // Compact records are supposed to carry 3 ("ignore") here; some
    // firmware writes other values, so force it.
    let numeric_format = if rectype == 2 {
        3
    } else {
        (body[15] & 0b1100_0000) >> 6
    };
    let rate = rate_text((body[15] & 0b11_1000) >> 3);
    let unit_mod = match body[15] & 0b110 {
        0b010 => "/",
        0b100 => " ",
        _ => "",
    };
    let percent = if body[15] & 1 == 1 { "% " } else { "" };
    let unit_suffix = format!(
        "{}{}{}{}",
        percent,
        unit_text(body[16]),
        unit_mod,
        unit_text(body[17])
    );

    let (name, linearization, factors) = if rectype == 1 {
        let linearization = body[18] & 0b111_1111;
        let factors = if linearization <= 11 {
            Some(ReadingFactors::decode(&body[19..25])?)
        } else {
            None
        };
        (tlv_decode(body[42], &body[43..]), linearization, factors)
    } else {
        (tlv_decode(body[26], &body[27..]), 0, None)
    };

    Ok(SensorRecord {
        owner,
        lun,
        number,
        entity_id,
        sensor_type,
        reading_type,
        name,
        readable: true,
        has_thresholds,
        numeric_format,
        unit_suffix,
        rate,
        linearization,
        factors,
        mfg_id,
        prod_id,
    })
}

fn decode_fru(body: &[u8]) -> Result<FruLocator, DecodeError> {
    if body.len() < 12 {
        return Err(DecodeError::Truncated);
    }
    Ok(FruLocator {
        name: tlv_decode(body[10], &body[11..]),
        number: body[1],
        logical: body[2] & 0b1000_0000 != 0,
        type_and_modifier: ((body[5] as u16) << 8) + body[6] as u16,
    })
}

// ─── Sensor readings ─────────────────────────────────────────────────────────

/// A converted sensor sample.
#[derive(Clone, Debug, PartialEq)]
pub struct SensorReading {
    /// Sensor name from its record.
    pub name: String,
    /// Unit suffix from its record.
    pub units: String,
    /// Converted value, absent for discrete sensors.
    pub value: Option<f64>,
    /// Half-width of the tolerance band around `value`.
    pub imprecision: Option<f64>,
    /// The sensor reports itself unreadable right now.
    pub unavailable: bool,
}

impl SensorRecord {
    /// True when conversion needs per-reading factors from the BMC
    /// (Get Sensor Reading Factors, netfn 0x04 command 0x23).
    pub fn needs_factors(&self) -> bool {
        self.linearization > 11
    }

    /// Convert a raw value with explicit factors and linearization.
    pub fn convert_with(&self, factors: &ReadingFactors, linearization: u8, raw: f64) -> f64 {
        let decoded = (raw * factors.m as f64 + factors.b) * 10f64.powi(factors.result_exp);
        linearize(linearization, decoded).unwrap_or(decoded)
    }

    /// Decode a Get Sensor Reading response using the record's static
    /// factors. Returns `None` when [`SensorRecord::needs_factors`].
    pub fn decode_reading(&self, data: &[u8]) -> Option<SensorReading> {
        if self.needs_factors() {
            return None;
        }
        let factors = self.factors.unwrap_or_default();
        Some(self.decode_reading_with(&factors, self.linearization, data))
    }

    /// Decode a reading with externally supplied factors (the 0x70 path
    /// fetches them per raw value, then converts linearly).
    pub fn decode_reading_with(
        &self,
        factors: &ReadingFactors,
        linearization: u8,
        data: &[u8],
    ) -> SensorReading {
        let mut reading = SensorReading {
            name: self.name.clone(),
            units: self.unit_suffix.clone(),
            value: None,
            imprecision: None,
            unavailable: false,
        };
        if data.len() < 2 || data[1] & 0b10_0000 != 0 || data[1] & 0b100_0000 == 0 {
            reading.unavailable = true;
            return reading;
        }
        let numeric = match self.numeric_format {
            2 => Some(twos_complement(data[0] as u32, 8) as f64),
            1 => Some(ones_complement(data[0] as u32, 8) as f64),
            0 if self.has_thresholds || self.reading_type == 1 => Some(data[0] as f64),
            _ => None,
        };
        if let Some(raw) = numeric {
            let half_band = 0.5 + factors.tolerance as f64 / 2.0;
            let lower = self.convert_with(factors, linearization, raw - half_band);
            let upper = self.convert_with(factors, linearization, raw + half_band);
            let value = (lower + upper) / 2.0;
            reading.value = Some(value);
            reading.imprecision = Some(value - lower);
        }
        reading
    }
}

// ─── Device and repository info ──────────────────────────────────────────────

/// Decoded Get Device ID response.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceId {
    /// Device id byte.
    pub device_id: u8,
    /// Device revision (low three bits).
    pub device_rev: u8,
    /// Firmware major (7 bits).
    pub fw_major: u8,
    /// Firmware minor, BCD rendered as two hex digits.
    pub fw_minor: String,
    /// IPMI version byte (0x51 = 1.5, 0x02 = 2.0).
    pub ipmi_version: u8,
    /// 20-bit manufacturer id.
    pub mfg_id: u32,
    /// Product id.
    pub prod_id: u16,
    /// Auxiliary firmware info, when present.
    pub aux_fw: Option<String>,
    /// Device SDRs present but no SDR repository device.
    pub device_sdrs_only: bool,
    /// The device claims sensor-device support.
    pub sensor_device: bool,
}

impl DeviceId {
    /// Decode a Get Device ID (0x06/0x01) response body.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 11 {
            return Err(DecodeError::Truncated);
        }
        let aux_fw = if data.len() > 14 {
            Some(
                data[11..15]
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join("."),
            )
        } else {
            None
        };
        Ok(Self {
            device_id: data[0],
            device_rev: data[1] & 0b111,
            fw_major: data[2] & 0b111_1111,
            fw_minor: format!("{:02X}", data[3]),
            ipmi_version: data[4],
            mfg_id: data[6] as u32 | (data[7] as u32) << 8 | (data[8] as u32) << 16,
            prod_id: data[9] as u16 | (data[10] as u16) << 8,
            aux_fw,
            device_sdrs_only: data[1] & 0b1000_0000 != 0 && data[5] & 0b10 == 0,
            sensor_device: data[5] & 1 != 0,
        })
    }
}

/// Decoded Get SDR Repository Info response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RepositoryInfo {
    /// SDR version byte.
    pub version: u8,
    /// Combined addition/erase timestamp, used as a cache-staleness key.
    pub modification_time: u64,
}

impl RepositoryInfo {
    /// Decode a Get SDR Repository Info (0x0A/0x20) response body.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 13 {
            return Err(DecodeError::Truncated);
        }
        Ok(Self {
            version: data[0],
            modification_time: u64::from_be_bytes(data[5..13].try_into().unwrap()),
        })
    }
}
