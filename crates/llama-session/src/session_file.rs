//! Session cache file: the tokens that were resident when it was written,
//! plus an optional opaque engine snapshot.
//!
//! # Format
//! ```text
//! [4 bytes: magic "LSES"]
//! [u32 LE: version]
//! [u32 LE: token count n]
//! [n x i32 LE: tokens]
//! [u32 LE: engine state length m]
//! [m bytes: engine state]
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use llama_engine::TokenId;

use crate::error::{ConfigError, Result};

const MAGIC: &[u8; 4] = b"LSES";
const VERSION: u32 = 1;

/// Contents of a session cache file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionFile {
    pub tokens: Vec<TokenId>,
    /// Engine snapshot; empty when the engine could not produce one.
    pub engine_state: Vec<u8>,
}

impl SessionFile {
    pub fn write_to(&self, mut w: impl Write) -> Result<()> {
        w.write_all(MAGIC)?;
        w.write_u32::<LittleEndian>(VERSION)?;
        w.write_u32::<LittleEndian>(len_u32(self.tokens.len())?)?;
        for &token in &self.tokens {
            w.write_i32::<LittleEndian>(token)?;
        }
        w.write_u32::<LittleEndian>(len_u32(self.engine_state.len())?)?;
        w.write_all(&self.engine_state)?;
        w.flush()?;
        Ok(())
    }

    pub fn read_from(mut r: impl Read) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(truncated)?;
        if &magic != MAGIC {
            return Err(ConfigError::SessionFile("bad magic".into()).into());
        }

        let version = r.read_u32::<LittleEndian>().map_err(truncated)?;
        if version != VERSION {
            return Err(
                ConfigError::SessionFile(format!("unsupported version {version}")).into(),
            );
        }

        let count = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let mut tokens = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            tokens.push(r.read_i32::<LittleEndian>().map_err(truncated)?);
        }

        let state_len = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let mut engine_state = Vec::with_capacity(state_len.min(1 << 24));
        (&mut r)
            .take(state_len as u64)
            .read_to_end(&mut engine_state)?;
        if engine_state.len() != state_len {
            return Err(truncated(std::io::ErrorKind::UnexpectedEof.into()).into());
        }

        Ok(Self {
            tokens,
            engine_state,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.write_to(BufWriter::new(File::create(path)?))
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::read_from(BufReader::new(File::open(path)?))
    }
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| ConfigError::SessionFile(format!("length {len} does not fit the format")).into())
}

fn truncated(e: std::io::Error) -> ConfigError {
    ConfigError::SessionFile(format!("truncated: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;

    #[test]
    fn bytes_roundtrip() {
        let file = SessionFile {
            tokens: vec![0, 17, -1, 40_000],
            engine_state: vec![1, 2, 3],
        };
        let mut buf = Vec::new();
        file.write_to(&mut buf).unwrap();
        assert_eq!(&buf[..4], b"LSES");
        assert_eq!(buf.len(), 4 + 4 + 4 + 16 + 4 + 3);
        assert_eq!(SessionFile::read_from(&buf[..]).unwrap(), file);
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let err = SessionFile::read_from(&b"NOPE\x01\0\0\0"[..]).unwrap_err();
        assert!(matches!(err, SessionError::Config(ConfigError::SessionFile(_))));

        let mut buf = Vec::new();
        SessionFile {
            tokens: vec![1, 2, 3],
            engine_state: vec![9; 8],
        }
        .write_to(&mut buf)
        .unwrap();
        for cut in [6, 14, buf.len() - 1] {
            let err = SessionFile::read_from(&buf[..cut]).unwrap_err();
            assert!(
                matches!(err, SessionError::Config(ConfigError::SessionFile(_))),
                "cut at {cut}: {err}"
            );
        }
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.session");
        let file = SessionFile {
            tokens: vec![5, 6, 7],
            engine_state: Vec::new(),
        };
        file.save(&path).unwrap();
        assert_eq!(SessionFile::load(&path).unwrap(), file);
    }
}
