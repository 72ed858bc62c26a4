//! Instruction words and operand extraction.

use std::fmt::{self, Display, Formatter};

/// One 16-bit big-endian instruction word.
///
/// The top nibble identifies the instruction family. The remaining bits
/// are carved into the standard operand fields:
///
/// - `NNN`: bits 0-11, a 12-bit address
/// - `NN`: bits 0-7, an 8-bit immediate
/// - `N`: bits 0-3, a 4-bit immediate
/// - `X`: bits 8-11, a register index
/// - `Y`: bits 4-7, a register index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode(pub u16);

impl Opcode {
    /// Assemble an opcode from the two consecutive memory bytes, high byte first.
    #[inline(always)]
    pub fn from_bytes(hi: u8, lo: u8) -> Self {
        Opcode(((hi as u16) << 8) | lo as u16)
    }

    /// Extract the instruction family from the top nibble.
    #[inline(always)]
    pub fn code(self) -> u8 {
        (self.0 >> 12) as u8
    }

    /// Extract operand NNN.
    #[inline(always)]
    pub fn nnn(self) -> u16 {
        self.0 & 0x0FFF
    }

    /// Extract operand NN.
    #[inline(always)]
    pub fn nn(self) -> u8 {
        (self.0 & 0x00FF) as u8
    }

    /// Extract operand N.
    #[inline(always)]
    pub fn n(self) -> u8 {
        (self.0 & 0x000F) as u8
    }

    /// Extract register index X.
    #[inline(always)]
    pub fn x(self) -> u8 {
        ((self.0 >> 8) & 0xF) as u8
    }

    /// Extract register index Y.
    #[inline(always)]
    pub fn y(self) -> u8 {
        ((self.0 >> 4) & 0xF) as u8
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_operand_fields() {
        let op = Opcode::from_bytes(0xD1, 0x2F);
        assert_eq!(op.0, 0xD12F);
        assert_eq!(op.code(), 0xD);
        assert_eq!(op.x(), 0x1);
        assert_eq!(op.y(), 0x2);
        assert_eq!(op.n(), 0xF);
        assert_eq!(op.nn(), 0x2F);
        assert_eq!(op.nnn(), 0x12F);
    }

    #[test]
    fn test_field_widths() {
        // Fields must respect their bit widths even when all bits are set.
        let op = Opcode(0xFFFF);
        assert_eq!(op.code(), 0xF);
        assert_eq!(op.x(), 0xF);
        assert_eq!(op.y(), 0xF);
        assert_eq!(op.n(), 0xF);
        assert_eq!(op.nn(), 0xFF);
        assert_eq!(op.nnn(), 0xFFF);
    }
}
