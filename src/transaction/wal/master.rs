use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Side file that remembers where the latest checkpoint ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterRecord {
    pub magic: u32,
    pub version: u32,
    /// Log offset of the latest CHECKPOINTEND record
    pub checkpoint_offset: u64,
}

impl MasterRecord {
    /// "WALM" in ASCII
    pub const MAGIC: u32 = 0x5741_4C4D;
    pub const VERSION: u32 = 1;
    pub const SIZE: usize = 16;

    pub fn new(checkpoint_offset: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            checkpoint_offset,
        }
    }

    /// Overwrite the master file and sync it
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_u32::<LittleEndian>(self.magic)?;
        file.write_u32::<LittleEndian>(self.version)?;
        file.write_u64::<LittleEndian>(self.checkpoint_offset)?;
        file.flush()?;
        file.sync_all()
    }

    /// Read the master file, `None` if it was never written
    pub fn read_from(path: &Path) -> io::Result<Option<Self>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut bytes = Vec::with_capacity(Self::SIZE);
        file.read_to_end(&mut bytes)?;
        if bytes.is_empty() {
            return Ok(None);
        }

        let mut cursor = io::Cursor::new(bytes);
        Ok(Some(Self {
            magic: cursor.read_u32::<LittleEndian>()?,
            version: cursor.read_u32::<LittleEndian>()?,
            checkpoint_offset: cursor.read_u64::<LittleEndian>()?,
        }))
    }

    pub fn validate(&self) -> bool {
        self.magic == Self::MAGIC && self.version == Self::VERSION
    }
}
