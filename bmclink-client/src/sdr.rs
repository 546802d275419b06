//! SDR repository reader with two cache tiers.
//!
//! The repository is fetched in reservation-guarded chunks, sized down on
//! 0xCA ("cannot return requested bytes") and re-reserved on 0xC5. Decoded
//! maps are shared process-wide keyed on firmware/product identity plus the
//! repository modification timestamp, and optionally persisted to disk as
//! length-prefixed raw records written via atomic rename.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use bmclink_proto::sdr::{
    DeviceId, FruLocator, ReadingFactors, RepositoryInfo, SdrRecord, SensorReading,
    SensorRecord, SDR_VERSION,
};

use crate::errors::IpmiError;
use crate::session::Session;

type CacheKey = (u8, String, u32, u16, u8, u64);

#[derive(Clone, Default)]
struct SdrMaps {
    sensors: HashMap<String, SensorRecord>,
    fru: HashMap<u8, FruLocator>,
}

fn shared_sdrs() -> &'static Mutex<HashMap<CacheKey, SdrMaps>> {
    static SHARED: OnceLock<Mutex<HashMap<CacheKey, SdrMaps>>> = OnceLock::new();
    SHARED.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The decoded sensor data repository of one BMC.
pub struct SdrRepository {
    /// Identity of the managed device.
    pub device: DeviceId,
    /// Sensor records keyed `{owner}.{number}.{lun}`.
    pub sensors: HashMap<String, SensorRecord>,
    /// FRU locator records keyed by device id.
    pub fru: HashMap<u8, FruLocator>,
}

impl SdrRepository {
    /// Fetch (or load from cache) the SDR of the session's BMC.
    pub async fn load(
        session: &mut Session,
        cache_dir: Option<&Path>,
    ) -> Result<Self, IpmiError> {
        let rsp = session.raw_command(0x06, 0x01, &[]).await?;
        if let Some(err) = rsp.error_text() {
            return Err(IpmiError::Protocol(err));
        }
        let device =
            DeviceId::decode(&rsp.data).map_err(|e| IpmiError::Protocol(e.to_string()))?;
        let mut repo = Self {
            device,
            sensors: HashMap::new(),
            fru: HashMap::new(),
        };
        if repo.device.device_sdrs_only {
            if repo.device.sensor_device {
                return Err(IpmiError::Unsupported(
                    "Device SDRs without an SDR repository are not supported".into(),
                ));
            }
            return Ok(repo);
        }
        repo.fetch(session, cache_dir).await?;
        Ok(repo)
    }

    /// Readable sensor keys, event-only records filtered out.
    pub fn readable_sensors(&self) -> impl Iterator<Item = &String> {
        self.sensors
            .iter()
            .filter(|(_, s)| s.readable)
            .map(|(k, _)| k)
    }

    async fn fetch(
        &mut self,
        session: &mut Session,
        cache_dir: Option<&Path>,
    ) -> Result<(), IpmiError> {
        let rsp = session.raw_command(0x0a, 0x20, &[]).await?;
        if let Some(err) = rsp.error_text() {
            return Err(IpmiError::Protocol(err));
        }
        let info =
            RepositoryInfo::decode(&rsp.data).map_err(|e| IpmiError::Protocol(e.to_string()))?;
        if info.version != SDR_VERSION {
            return Err(IpmiError::Unsupported(format!(
                "Unsupported SDR repository version {:#04x}",
                info.version
            )));
        }

        let key: CacheKey = (
            self.device.fw_major,
            self.device.fw_minor.clone(),
            self.device.mfg_id,
            self.device.prod_id,
            self.device.device_id,
            info.modification_time,
        );
        if let Some(maps) = shared_sdrs().lock().expect("sdr cache lock").get(&key) {
            self.sensors = maps.sensors.clone();
            self.fru = maps.fru.clone();
            return Ok(());
        }

        let cache_file = cache_dir.map(|dir| self.cache_path(dir, info.modification_time));
        if let Some(path) = cache_file.as_deref() {
            if self.load_disk_cache(path).is_ok() {
                log::debug!("[bmclink] SDR loaded from {}", path.display());
                self.store_shared(&key);
                return Ok(());
            }
            self.sensors.clear();
            self.fru.clear();
        }

        let raw = self.fetch_from_bmc(session).await?;
        self.store_shared(&key);
        if let Some(path) = cache_file.as_deref() {
            if let Err(e) = write_disk_cache(path, &raw) {
                log::warn!("[bmclink] failed to write SDR cache {}: {e}", path.display());
            }
        }
        Ok(())
    }

    async fn fetch_from_bmc(&mut self, session: &mut Session) -> Result<Vec<Vec<u8>>, IpmiError> {
        let mut blacklist = HashSet::new();
        let mut raw_records = Vec::new();

        let mut recid: u16 = 0;
        let mut rsvid: u16 = 0;
        let mut offset: usize = 0;
        let mut size: usize = 0xff;
        let mut chunksize: usize = 128;

        // 0xFFFF marks the repository end (33.12).
        while recid != 0xffff {
            let mut newrecid: u16 = 0;
            let mut currlen: usize = 0;
            let mut record = Vec::new();
            loop {
                if size != 0xff && rsvid == 0 {
                    rsvid = get_reservation(session).await?;
                }
                let rq = [
                    (rsvid & 0xff) as u8,
                    (rsvid >> 8) as u8,
                    (recid & 0xff) as u8,
                    (recid >> 8) as u8,
                    offset as u8,
                    size as u8,
                ];
                let rsp = session.raw_command(0x0a, 0x23, &rq).await?;
                if rsp.code == 0xca {
                    if size == 0xff {
                        // Read just the header first to learn the length.
                        size = 5;
                    } else if size > 5 {
                        // Halve, then push back up a little so the tail
                        // read is less likely to fall one byte short.
                        size = size / 2 + 2;
                        chunksize = size;
                    }
                    continue;
                }
                if rsp.code == 0xc5 {
                    rsvid = 0;
                    continue;
                }
                if let Some(err) = rsp.error_text() {
                    return Err(IpmiError::Protocol(err));
                }
                if rsp.data.len() < 7 && offset == 0 {
                    return Err(IpmiError::Protocol("Short SDR read".into()));
                }
                if newrecid == 0 {
                    newrecid = ((rsp.data[1] as u16) << 8) + rsp.data[0] as u16;
                }
                if currlen == 0 {
                    // Record byte 4 is the body length; add the header.
                    currlen = rsp.data[6] as usize + 5;
                }
                record.extend_from_slice(&rsp.data[2..]);
                offset += size;
                if offset >= currlen {
                    break;
                }
                if size == 5 && offset == 5 {
                    size = chunksize;
                }
                if offset + size > currlen {
                    size = currlen - offset;
                }
            }
            self.add_record(&record, &mut blacklist)?;
            raw_records.push(record);
            offset = 0;
            if size != 0xff {
                size = 5;
            }
            if newrecid == recid {
                return Err(IpmiError::Protocol(
                    "Incorrect SDR record id from BMC".into(),
                ));
            }
            recid = newrecid;
        }

        for key in &blacklist {
            self.sensors.remove(key);
        }
        Ok(raw_records)
    }

    fn add_record(
        &mut self,
        bytes: &[u8],
        blacklist: &mut HashSet<String>,
    ) -> Result<(), IpmiError> {
        let record = SdrRecord::decode_with_ids(bytes, self.device.mfg_id, self.device.prod_id)
            .map_err(|e| IpmiError::Protocol(e.to_string()))?;
        match record {
            SdrRecord::FruLocator(fru) => {
                // First locator for a device id wins; later duplicates are
                // firmware bugs.
                self.fru.entry(fru.number).or_insert(fru);
            }
            SdrRecord::FullSensor(sensor)
            | SdrRecord::CompactSensor(sensor)
            | SdrRecord::EventOnlySensor(sensor) => {
                let key = format!("{}.{}.{}", sensor.owner, sensor.number, sensor.lun);
                if self.sensors.contains_key(&key) {
                    // A duplicated sensor id makes both records suspect.
                    blacklist.insert(key);
                } else {
                    self.sensors.insert(key, sensor);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn store_shared(&self, key: &CacheKey) {
        shared_sdrs().lock().expect("sdr cache lock").insert(
            key.clone(),
            SdrMaps {
                sensors: self.sensors.clone(),
                fru: self.fru.clone(),
            },
        );
    }

    fn cache_path(&self, dir: &Path, modtime: u64) -> PathBuf {
        dir.join(format!(
            "sdrcache-2.{}.{}.{}.{}.{}.{}",
            self.device.mfg_id,
            self.device.prod_id,
            self.device.device_id,
            self.device.fw_major,
            self.device.fw_minor,
            modtime
        ))
    }

    fn load_disk_cache(&mut self, path: &Path) -> Result<(), IpmiError> {
        let bytes = fs::read(path)?;
        let mut blacklist = HashSet::new();
        let mut at = 0;
        while at + 2 <= bytes.len() {
            let len = u16::from_be_bytes([bytes[at], bytes[at + 1]]) as usize;
            at += 2;
            if at + len > bytes.len() {
                return Err(IpmiError::Protocol("Truncated SDR cache file".into()));
            }
            self.add_record(&bytes[at..at + len], &mut blacklist)?;
            at += len;
        }
        for key in &blacklist {
            self.sensors.remove(key);
        }
        Ok(())
    }
}

async fn get_reservation(session: &mut Session) -> Result<u16, IpmiError> {
    let rsp = session.raw_command(0x0a, 0x22, &[]).await?;
    if let Some(err) = rsp.error_text() {
        return Err(IpmiError::Protocol(err));
    }
    if rsp.data.len() < 2 {
        return Err(IpmiError::Protocol("Short SDR reservation response".into()));
    }
    Ok(rsp.data[0] as u16 + ((rsp.data[1] as u16) << 8))
}

fn write_disk_cache(path: &Path, records: &[Vec<u8>]) -> std::io::Result<()> {
    let mut blob = Vec::new();
    for record in records {
        blob.extend_from_slice(&(record.len() as u16).to_be_bytes());
        blob.extend_from_slice(record);
    }
    // Write-then-rename so readers never see a half-written cache.
    let mut suffix = [0u8; 6];
    getrandom::getrandom(&mut suffix).expect("getrandom");
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(
        ".{}",
        suffix.iter().map(|b| format!("{b:02x}")).collect::<String>()
    ));
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, blob)?;
    fs::rename(&tmp, path)
}

/// Read and convert one sensor, fetching per-reading factors when the
/// record is non-linear (linearization 0x70 and up).
pub async fn read_sensor(
    session: &mut Session,
    record: &SensorRecord,
) -> Result<SensorReading, IpmiError> {
    if !record.readable {
        return Err(IpmiError::InvalidArgument(
            "Sensor is event-only and cannot be read".into(),
        ));
    }
    let rsp = session.raw_command(0x04, 0x2d, &[record.number]).await?;
    if let Some(err) = rsp.error_text() {
        return Err(IpmiError::Protocol(err));
    }
    if record.needs_factors() {
        let raw = rsp.data.first().copied().unwrap_or(0);
        let frsp = session
            .raw_command(0x04, 0x23, &[record.number, raw])
            .await?;
        if let Some(err) = frsp.error_text() {
            return Err(IpmiError::Protocol(err));
        }
        if frsp.data.len() < 7 {
            return Err(IpmiError::Protocol(
                "Short sensor reading factors response".into(),
            ));
        }
        let factors = ReadingFactors::decode(&frsp.data[1..7])
            .map_err(|e| IpmiError::Protocol(e.to_string()))?;
        Ok(record.decode_reading_with(&factors, 0, &rsp.data))
    } else {
        record
            .decode_reading(&rsp.data)
            .ok_or_else(|| IpmiError::Protocol("Sensor lacks conversion factors".into()))
    }
}
