// src/meta.rs - FolioDB file header + pragma block (slot 0)
//
// File header (first FILE_HEADER_SIZE bytes of slot 0, LE):
//   [0..16)   magic "** FolioDB v1 **"
//   16        file version u8
//   17        encrypted u8 (0/1)
//   [18..34)  salt [16]
//   [34..50)  instance id [16]
//   [50..58)  creation time i64 (unix secs)
//   [58..62)  collation LCID u32
//   [62..66)  collation options u32
//   [66..69)  engine version (major, minor, patch)
//   69        is_dirty u8 (1 = not cleanly closed, recovery on open)
//
// Pragma block (PRAGMA_SIZE bytes at PRAGMA_OFFSET):
//   [0..4)    user_version i32
//   4         limit_size_id u8
//   [5..9)    checkpoint u32 (pages; 0 = no auto checkpoint)
//   [9..13)   timeout_secs u32
//   13        utc_date u8
//
// Политика: оба блока - обычные счётчики, не защищены WAL, перезаписываются на месте
// отдельными sub-page записями (Disk::write_buffer с длиной FILE_HEADER_SIZE / PRAGMA_SIZE).

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::consts::{ENGINE_VERSION, FILE_HEADER_SIZE, FILE_MAGIC, FILE_VERSION, PRAGMA_SIZE};

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 16;
const OFF_ENCRYPTED: usize = 17;
const OFF_SALT: usize = 18;
const OFF_INSTANCE_ID: usize = 34;
const OFF_CREATED: usize = 50;
const OFF_COLLATION_LCID: usize = 58;
const OFF_COLLATION_OPTS: usize = 62;
const OFF_ENGINE_VERSION: usize = 66;
const OFF_DIRTY: usize = 69;

const P_OFF_USER_VERSION: usize = 0;
const P_OFF_LIMIT_SIZE: usize = 4;
const P_OFF_CHECKPOINT: usize = 5;
const P_OFF_TIMEOUT: usize = 9;
const P_OFF_UTC_DATE: usize = 13;

/// Collation identifier stored in the header; interpreted by higher layers only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Collation {
    pub lcid: u32,
    pub options: u32,
}

impl Default for Collation {
    fn default() -> Self {
        // invariant culture, ignore-case
        Self { lcid: 127, options: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u8,
    pub encrypted: bool,
    pub salt: [u8; 16],
    pub instance_id: [u8; 16],
    pub created_secs: i64,
    pub collation: Collation,
    pub engine_version: (u8, u8, u8),
    pub is_dirty: bool,
}

impl FileHeader {
    /// Header for a brand-new file (random instance id, current time).
    pub fn new(collation: Collation) -> Self {
        use rand::RngCore;
        let mut instance_id = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut instance_id);
        Self {
            version: FILE_VERSION,
            encrypted: false,
            salt: [0u8; 16],
            instance_id,
            created_secs: now_secs_i64(),
            collation,
            engine_version: ENGINE_VERSION,
            is_dirty: false,
        }
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_HEADER_SIZE {
            return Err(anyhow!("file header buffer too small"));
        }
        if &buf[OFF_MAGIC..OFF_MAGIC + FILE_MAGIC.len()] != FILE_MAGIC {
            return Err(anyhow!("bad file header magic"));
        }
        let version = buf[OFF_VERSION];
        if version != FILE_VERSION {
            return Err(anyhow!("unsupported file version {}", version));
        }
        let mut salt = [0u8; 16];
        salt.copy_from_slice(&buf[OFF_SALT..OFF_SALT + 16]);
        let mut instance_id = [0u8; 16];
        instance_id.copy_from_slice(&buf[OFF_INSTANCE_ID..OFF_INSTANCE_ID + 16]);
        Ok(Self {
            version,
            encrypted: buf[OFF_ENCRYPTED] != 0,
            salt,
            instance_id,
            created_secs: LittleEndian::read_i64(&buf[OFF_CREATED..OFF_CREATED + 8]),
            collation: Collation {
                lcid: LittleEndian::read_u32(&buf[OFF_COLLATION_LCID..OFF_COLLATION_LCID + 4]),
                options: LittleEndian::read_u32(&buf[OFF_COLLATION_OPTS..OFF_COLLATION_OPTS + 4]),
            },
            engine_version: (
                buf[OFF_ENGINE_VERSION],
                buf[OFF_ENGINE_VERSION + 1],
                buf[OFF_ENGINE_VERSION + 2],
            ),
            is_dirty: buf[OFF_DIRTY] != 0,
        })
    }

    /// Записать заголовок в первые FILE_HEADER_SIZE байт `buf`.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < FILE_HEADER_SIZE {
            return Err(anyhow!("file header buffer too small"));
        }
        buf[..FILE_HEADER_SIZE].fill(0);
        buf[OFF_MAGIC..OFF_MAGIC + FILE_MAGIC.len()].copy_from_slice(FILE_MAGIC);
        buf[OFF_VERSION] = self.version;
        buf[OFF_ENCRYPTED] = self.encrypted as u8;
        buf[OFF_SALT..OFF_SALT + 16].copy_from_slice(&self.salt);
        buf[OFF_INSTANCE_ID..OFF_INSTANCE_ID + 16].copy_from_slice(&self.instance_id);
        LittleEndian::write_i64(&mut buf[OFF_CREATED..OFF_CREATED + 8], self.created_secs);
        LittleEndian::write_u32(
            &mut buf[OFF_COLLATION_LCID..OFF_COLLATION_LCID + 4],
            self.collation.lcid,
        );
        LittleEndian::write_u32(
            &mut buf[OFF_COLLATION_OPTS..OFF_COLLATION_OPTS + 4],
            self.collation.options,
        );
        buf[OFF_ENGINE_VERSION] = self.engine_version.0;
        buf[OFF_ENGINE_VERSION + 1] = self.engine_version.1;
        buf[OFF_ENGINE_VERSION + 2] = self.engine_version.2;
        buf[OFF_DIRTY] = self.is_dirty as u8;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<[u8; FILE_HEADER_SIZE]> {
        let mut out = [0u8; FILE_HEADER_SIZE];
        self.write(&mut out)?;
        Ok(out)
    }
}

/// Mutable engine counters stored next to the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pragmas {
    pub user_version: i32,
    pub limit_size_id: u8,
    pub checkpoint: u32,
    pub timeout_secs: u32,
    pub utc_date: bool,
}

impl Default for Pragmas {
    fn default() -> Self {
        Self {
            user_version: 0,
            limit_size_id: 0,
            checkpoint: crate::consts::DEFAULT_CHECKPOINT_PAGES,
            timeout_secs: 60,
            utc_date: false,
        }
    }
}

impl Pragmas {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < PRAGMA_SIZE {
            return Err(anyhow!("pragma buffer too small"));
        }
        Ok(Self {
            user_version: LittleEndian::read_i32(&buf[P_OFF_USER_VERSION..P_OFF_USER_VERSION + 4]),
            limit_size_id: buf[P_OFF_LIMIT_SIZE],
            checkpoint: LittleEndian::read_u32(&buf[P_OFF_CHECKPOINT..P_OFF_CHECKPOINT + 4]),
            timeout_secs: LittleEndian::read_u32(&buf[P_OFF_TIMEOUT..P_OFF_TIMEOUT + 4]),
            utc_date: buf[P_OFF_UTC_DATE] != 0,
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < PRAGMA_SIZE {
            return Err(anyhow!("pragma buffer too small"));
        }
        buf[..PRAGMA_SIZE].fill(0);
        LittleEndian::write_i32(
            &mut buf[P_OFF_USER_VERSION..P_OFF_USER_VERSION + 4],
            self.user_version,
        );
        buf[P_OFF_LIMIT_SIZE] = self.limit_size_id;
        LittleEndian::write_u32(&mut buf[P_OFF_CHECKPOINT..P_OFF_CHECKPOINT + 4], self.checkpoint);
        LittleEndian::write_u32(&mut buf[P_OFF_TIMEOUT..P_OFF_TIMEOUT + 4], self.timeout_secs);
        buf[P_OFF_UTC_DATE] = self.utc_date as u8;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<[u8; PRAGMA_SIZE]> {
        let mut out = [0u8; PRAGMA_SIZE];
        self.write(&mut out)?;
        Ok(out)
    }
}

fn now_secs_i64() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_and_dirty_flag() {
        let mut h = FileHeader::new(Collation::default());
        h.is_dirty = true;
        let bytes = h.to_bytes().unwrap();
        let got = FileHeader::read(&bytes).unwrap();
        assert_eq!(got, h);
        assert!(got.is_dirty);
    }

    #[test]
    fn bad_magic_rejected() {
        let bytes = [0u8; FILE_HEADER_SIZE];
        let err = FileHeader::read(&bytes).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn pragmas_persist_fields() {
        let p = Pragmas {
            user_version: -3,
            limit_size_id: 2,
            checkpoint: 77,
            timeout_secs: 5,
            utc_date: true,
        };
        let bytes = p.to_bytes().unwrap();
        assert_eq!(Pragmas::read(&bytes).unwrap(), p);
    }
}
