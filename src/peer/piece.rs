use crate::peer::{Bitfield, PeerError};
use crate::util::sha1_hash;

pub const BLOCK_SIZE: u32 = 16 * 1024;

/// A byte range within a piece, the unit named by a `request` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub begin: u32,
    pub length: u32,
}

/// Splits a piece into consecutive blocks of `block_size`, the last one
/// holding the remainder. A zero `block_size` yields no blocks.
pub fn block_plan(piece_len: u32, block_size: u32) -> Vec<Block> {
    if block_size == 0 {
        return Vec::new();
    }
    let mut blocks = Vec::with_capacity(piece_len.div_ceil(block_size) as usize);
    let mut begin = 0;
    while begin < piece_len {
        let length = block_size.min(piece_len - begin);
        blocks.push(Block { begin, length });
        begin += length;
    }
    blocks
}

/// Checks assembled piece data against its expected SHA-1.
pub fn verify_piece(index: u32, data: Vec<u8>, expected_hash: &[u8; 20]) -> Result<Vec<u8>, PeerError> {
    if sha1_hash(&data) != *expected_hash {
        return Err(PeerError::PieceHashMismatch { index });
    }
    Ok(data)
}

/// Scratch buffer for one piece while its blocks arrive.
#[derive(Debug)]
pub struct PieceAssembly {
    index: u32,
    expected_hash: [u8; 20],
    block_size: u32,
    blocks: Vec<Block>,
    filled: Bitfield,
    data: Vec<u8>,
}

impl PieceAssembly {
    pub fn new(index: u32, length: u32, expected_hash: [u8; 20], block_size: u32) -> Result<Self, PeerError> {
        if length == 0 || block_size == 0 {
            return Err(PeerError::InvalidPieceLength(length as u64));
        }
        let blocks = block_plan(length, block_size);
        Ok(PieceAssembly {
            index,
            expected_hash,
            block_size,
            filled: Bitfield::new(blocks.len(), false),
            blocks,
            data: vec![0; length as usize],
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn missing_blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.blocks.iter().enumerate().filter(|(i, _)| !self.filled.has(*i)).map(|(_, block)| *block)
    }

    /// Copies a received block into place. Returns `false` for a block that
    /// was already filled.
    pub fn add_block(&mut self, begin: u32, bytes: &[u8]) -> Result<bool, PeerError> {
        let unexpected = PeerError::UnexpectedBlock { begin, length: bytes.len() };
        if begin % self.block_size != 0 {
            return Err(unexpected);
        }
        let slot = (begin / self.block_size) as usize;
        match self.blocks.get(slot) {
            Some(block) if block.length as usize == bytes.len() => {
                if self.filled.has(slot) {
                    return Ok(false);
                }
                let start = begin as usize;
                self.data[start..start + bytes.len()].copy_from_slice(bytes);
                self.filled.set(slot);
                Ok(true)
            }
            _ => Err(unexpected),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.filled.all()
    }

    /// Consumes the assembly, handing back the data if it hashes correctly.
    pub fn verify(self) -> Result<Vec<u8>, PeerError> {
        if !self.is_complete() {
            return Err(PeerError::IncompletePiece(self.index));
        }
        verify_piece(self.index, self.data, &self.expected_hash)
    }
}
