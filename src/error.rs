//! Result and errors.
use std::fmt::{self, Display, Formatter};

pub type Chip8Result<T> = std::result::Result<T, Chip8Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chip8Error {
    /// The program counter or an I-relative access left the 4 KiB address space.
    MemoryOutOfBounds { address: usize },
    /// Call nested deeper than the return stack allows.
    StackOverflow,
    /// Return executed with an empty return stack.
    StackUnderflow,
    /// Attempt to load a program image that can't fit in memory.
    ProgramTooLarge { size: usize, capacity: usize },
}

impl Display for Chip8Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryOutOfBounds { address } => {
                write!(f, "memory access out of bounds: 0x{:04X}", address)
            }
            Self::StackOverflow => write!(f, "call stack overflow"),
            Self::StackUnderflow => write!(f, "call stack underflow"),
            Self::ProgramTooLarge { size, capacity } => {
                write!(f, "program is {} bytes; memory fits {}", size, capacity)
            }
        }
    }
}

impl std::error::Error for Chip8Error {}
