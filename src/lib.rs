pub mod constants;
mod cpu;
mod devices;
mod error;
mod opcode;
mod vm;

pub use self::opcode::Opcode;

/// Read-only view of the 64x32 display buffer, row-major.
pub type Chip8DisplayBuffer<'a> = &'a [bool; constants::DISPLAY_BUFFER_SIZE];

pub mod prelude {
    pub use super::{
        devices::{InvalidKeyCode, KeyCode},
        error::{Chip8Error, Chip8Result},
        vm::{Chip8Conf, Chip8Vm, Flow, FrameTick, Quirks},
    };
}
