//! The block archive: one RLP-encoded block per file, named by number.

use std::path::PathBuf;

use crate::primitives::Block;
use crate::{DbError, DbResult};

#[derive(Clone, Debug)]
pub struct BlockDb {
    dir: PathBuf,
}

impl BlockDb {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_of(&self, number: u64) -> PathBuf {
        self.dir.join(format!("{number}.rlp"))
    }

    /// `None` when the archive has no block at `number`.
    pub fn read(&self, number: u64) -> DbResult<Option<Block>> {
        let path = self.path_of(number);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(Block::decode_rlp(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DbError::io(err)),
        }
    }

    pub fn write(&self, block: &Block) -> DbResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(DbError::io)?;
        std::fs::write(self.path_of(block.header.number), block.encode_rlp())
            .map_err(DbError::io)
    }
}
