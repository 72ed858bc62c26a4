//! CPU and memory state.
use crate::constants::*;

/// Core state for a chip8 interpreter.
pub struct Chip8Cpu {
    // ------------------------------------------------------------------------
    // Registers
    /// Program counter pointing to the current position in the program.
    pub(crate) pc: usize,
    /// Stack pointer, indicating the next free slot on the stack.
    pub(crate) sp: usize,
    /// General purpose registers for temporary values.
    ///
    /// Register 16 (VF) is used for either the carry flag or borrow switch depending on opcode.
    pub(crate) registers: [u8; REGISTER_COUNT],
    /// Pointer register used for temporarily storing an address. Since addresses are 12 bits, only the
    /// lowest (rightmost) bits are used.
    pub(crate) address: Address,
    /// (DT) Delay timer that counts down to 0.
    pub(crate) delay_timer: u8,
    /// (ST) Sound timer that counts down to 0. When it has a non-zero value, a beep is played.
    pub(crate) sound_timer: u8,
    /// Switch tracking whether the buzzer should be on or off.
    pub(crate) buzzer_state: bool,
    /// Indicates that the machine is waiting for a keypress.
    pub(crate) key_wait: bool,
    /// Keypad input state. Pressed is a 1 bit, released is a 0 bit.
    pub(crate) key_state: u16,

    // ------------------------------------------------------------------------
    // Memory
    /// Main memory storage space.
    pub(crate) ram: Box<[u8; MEM_SIZE]>,
    /// Stack of return pointers used for jumping when a routine call finishes.
    pub(crate) stack: Box<[Address; STACK_SIZE]>,
    /// Screen buffer that is drawn to.
    pub(crate) display: Box<[bool; DISPLAY_BUFFER_SIZE]>,
}

impl Default for Chip8Cpu {
    fn default() -> Self {
        Self {
            pc: 0,
            sp: 0,
            registers: [0; REGISTER_COUNT],
            address: 0,
            delay_timer: 0,
            sound_timer: 0,
            buzzer_state: false,
            key_wait: false,
            key_state: 0,

            ram: Box::new([0; MEM_SIZE]),
            stack: Box::new([0; STACK_SIZE]),
            display: Box::new([false; DISPLAY_BUFFER_SIZE]),
        }
    }
}

impl Chip8Cpu {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Erase all machine state in preparation for loading a fresh program.
    pub(crate) fn reset(&mut self) {
        self.pc = 0;
        self.sp = 0;
        self.registers = [0; REGISTER_COUNT];
        self.address = 0;
        self.delay_timer = 0;
        self.sound_timer = 0;
        self.buzzer_state = false;
        self.key_wait = false;
        self.key_state = 0;

        self.ram.fill(0);
        self.stack.fill(0);
        self.display.fill(false);
    }

    pub(crate) fn clear_display(&mut self) {
        self.display.fill(false);
    }

    pub(crate) fn set_key_state(&mut self, key_id: u8, state: bool) {
        if key_id < KEY_COUNT {
            if state {
                self.key_state |= 1 << key_id;
            } else {
                self.key_state &= !(1 << key_id);
            }
        }
    }

    pub(crate) fn key_state(&self, key_id: u8) -> bool {
        if key_id < KEY_COUNT {
            self.key_state & (1 << key_id) > 0
        } else {
            false
        }
    }

    /// Check whether any key is pressed down.
    #[inline(always)]
    pub(crate) fn any_key(&self) -> bool {
        self.key_state > 0
    }

    /// Retrieve the value of the lowest-numbered key that is pressed down.
    ///
    /// Which key to pick when several are held is unspecified by the
    /// instruction set; lowest code keeps the choice deterministic.
    #[inline]
    pub(crate) fn first_key(&self) -> Option<u8> {
        if self.any_key() {
            for k in 0..KEY_COUNT {
                if self.key_state(k) {
                    return Some(k);
                }
            }
        }
        None
    }

    /// Clear the keypad input state, setting all keys to up.
    #[inline(always)]
    pub(crate) fn clear_keys(&mut self) {
        self.key_state = 0;
    }

    /// Count down the delay timer.
    #[inline]
    pub(crate) fn tick_delay(&mut self) {
        // The checked_sub implementation uses `unlikely!()` which degrades performance.
        let (val, underflow) = self.delay_timer.overflowing_sub(1);
        if !underflow {
            self.delay_timer = val;
        }
    }

    /// Count down the sound timer.
    #[inline]
    pub(crate) fn tick_sound(&mut self) {
        let (val, underflow) = self.sound_timer.overflowing_sub(1);
        if !underflow {
            self.sound_timer = val;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_key_state() {
        let mut cpu = Chip8Cpu::default();

        cpu.set_key_state(0, true);
        assert_eq!(cpu.key_state, 0b00000000_00000001);
        assert!(cpu.key_state(0));
        assert!(!cpu.key_state(1));
        assert!(!cpu.key_state(7));

        cpu.set_key_state(7, true);
        assert_eq!(cpu.key_state, 0b00000000_10000001);
        assert!(cpu.key_state(0));
        assert!(!cpu.key_state(1));
        assert!(cpu.key_state(7));

        cpu.set_key_state(0, false);
        assert_eq!(cpu.key_state, 0b00000000_10000000);
        assert!(!cpu.key_state(0));
        assert!(!cpu.key_state(1));
        assert!(cpu.key_state(7));

        cpu.set_key_state(15, true);
        assert_eq!(cpu.key_state, 0b10000000_10000000);
        assert!(!cpu.key_state(0));
        assert!(!cpu.key_state(1));
        assert!(cpu.key_state(7));
        assert!(cpu.key_state(15));
    }

    #[test]
    fn test_key_state_idempotent() {
        let mut cpu = Chip8Cpu::default();

        cpu.set_key_state(3, true);
        cpu.set_key_state(3, true);
        assert_eq!(cpu.key_state, 0b00000000_00001000);

        cpu.set_key_state(3, false);
        cpu.set_key_state(3, false);
        assert_eq!(cpu.key_state, 0);
    }

    #[test]
    fn test_key_state_out_of_range() {
        let mut cpu = Chip8Cpu::default();

        cpu.set_key_state(16, true);
        assert_eq!(cpu.key_state, 0);
        assert!(!cpu.key_state(16));
    }

    #[test]
    fn test_first_key_is_lowest() {
        let mut cpu = Chip8Cpu::default();
        assert_eq!(cpu.first_key(), None);

        cpu.set_key_state(0xC, true);
        cpu.set_key_state(0x4, true);
        assert_eq!(cpu.first_key(), Some(0x4));
    }

    #[test]
    fn test_timers_stop_at_zero() {
        let mut cpu = Chip8Cpu::default();
        cpu.delay_timer = 2;
        cpu.sound_timer = 1;

        cpu.tick_delay();
        cpu.tick_sound();
        assert_eq!(cpu.delay_timer, 1);
        assert_eq!(cpu.sound_timer, 0);

        cpu.tick_delay();
        cpu.tick_sound();
        cpu.tick_delay();
        cpu.tick_sound();
        assert_eq!(cpu.delay_timer, 0);
        assert_eq!(cpu.sound_timer, 0);
    }
}
