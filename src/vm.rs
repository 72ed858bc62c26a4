//! Virtual machine.
use std::fmt::{self, Write};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    constants::*,
    cpu::Chip8Cpu,
    devices::KeyCode,
    error::{Chip8Error, Chip8Result},
    opcode::Opcode,
    Chip8DisplayBuffer,
};

/// Handler for one instruction family or secondary code.
type OpFn = fn(&mut Chip8Vm, Opcode) -> Chip8Result<Flow>;

/// Primary dispatch table, keyed on the top nibble of the opcode word.
const PRIMARY: [OpFn; 16] = [
    Chip8Vm::op_sys,          // 0x0: 00E0 / 00EE
    Chip8Vm::op_jump,         // 1NNN
    Chip8Vm::op_call,         // 2NNN
    Chip8Vm::op_skip_eq_nn,   // 3XNN
    Chip8Vm::op_skip_ne_nn,   // 4XNN
    Chip8Vm::op_skip_eq_xy,   // 5XY0
    Chip8Vm::op_load_nn,      // 6XNN
    Chip8Vm::op_add_nn,       // 7XNN
    Chip8Vm::op_math,         // 8XYN, re-dispatched on N
    Chip8Vm::op_skip_ne_xy,   // 9XY0
    Chip8Vm::op_load_address, // ANNN
    Chip8Vm::op_jump_offset,  // BNNN
    Chip8Vm::op_random,       // CXNN
    Chip8Vm::op_draw,         // DXYN
    Chip8Vm::op_input,        // EX9E / EXA1
    Chip8Vm::op_misc,         // FXNN, re-dispatched on NN
];

/// Arithmetic family 8XYN, keyed on the low nibble N.
const MATH: [OpFn; 16] = {
    let mut table = [Chip8Vm::op_unmapped as OpFn; 16];
    table[0x0] = Chip8Vm::op_math_load;
    table[0x1] = Chip8Vm::op_math_or;
    table[0x2] = Chip8Vm::op_math_and;
    table[0x3] = Chip8Vm::op_math_xor;
    table[0x4] = Chip8Vm::op_math_add;
    table[0x5] = Chip8Vm::op_math_sub;
    table[0x6] = Chip8Vm::op_math_shr;
    table[0x7] = Chip8Vm::op_math_subn;
    table[0xE] = Chip8Vm::op_math_shl;
    table
};

/// Miscellaneous family FXNN, keyed on the full NN byte.
const MISC: [OpFn; 256] = {
    let mut table = [Chip8Vm::op_unmapped as OpFn; 256];
    table[0x07] = Chip8Vm::op_load_delay;
    table[0x0A] = Chip8Vm::op_key_wait;
    table[0x15] = Chip8Vm::op_set_delay;
    table[0x18] = Chip8Vm::op_set_sound;
    table[0x1E] = Chip8Vm::op_add_address;
    table[0x29] = Chip8Vm::op_font_glyph;
    table[0x33] = Chip8Vm::op_bcd;
    table[0x55] = Chip8Vm::op_store_registers;
    table[0x65] = Chip8Vm::op_load_registers;
    table
};

pub struct Chip8Vm {
    cpu: Chip8Cpu,
    rng: StdRng,
    conf: Chip8Conf,
    unknown_op_count: usize,
}

/// Control flow signal returned by an instruction cycle, so the host
/// loop can react without inspecting machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flow {
    Ok,
    /// Program counter has jumped to a new address.
    ///
    /// This is useful for the caller to avoid being
    /// blocked on infinite or long running loops.
    ///
    /// This is returned when the interpreter encounters:
    ///
    /// - 1nnn (`JP addr`)
    /// - Bnnn (`JP V0, addr`)
    /// - 2nnn (`CALL addr`)
    /// - 00EE (`RET`)
    Jump,
    /// The display buffer changed and can be presented.
    Draw,
    /// The sound timer was set and the buzzer state may have changed.
    Sound,
    /// Wait for a keypress.
    ///
    /// This is triggered by the opcode `Fx0A` (`LD Vx, K`), which stops
    /// execution until a key is pressed, and loads the key value into `Vx`.
    KeyWait,
}

/// VM Configuration Parameters.
#[derive(Debug, Default, Clone)]
pub struct Chip8Conf {
    /// Seed for the `CXNN` random source. `None` draws a seed from the
    /// operating system, which is what a host running real programs wants;
    /// tests pass a fixed seed for reproducible runs.
    pub rng_seed: Option<u64>,
    pub quirks: Quirks,
}

/// Points where historical Chip-8 interpreters disagree on behaviour.
#[derive(Debug, Default, Clone, Copy)]
pub struct Quirks {
    /// `8XY6`/`8XYE` read the shift source from VY instead of VX.
    ///
    /// The default shifts VX in place by one bit, with VY unused.
    pub shift_reads_vy: bool,
}

/// Timer tick outcome, published to the render and audio bridges once
/// per 60 Hz tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTick {
    /// Whether the buzzer should currently be sounding.
    pub buzzer: bool,
    /// Remaining sound timer value, in 60 Hz ticks.
    pub sound_timer: u8,
}

impl Chip8Vm {
    pub fn new(conf: Chip8Conf) -> Self {
        let rng = match conf.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Chip8Vm {
            cpu: Chip8Cpu::new(),
            rng,
            conf,
            unknown_op_count: 0,
        }
    }

    /// Configuration that was used to instantiate the VM.
    pub fn config(&self) -> &Chip8Conf {
        &self.conf
    }

    /// Load a program image into memory, replacing whatever was there.
    ///
    /// The image is copied verbatim to the program origin `0x200`. An
    /// image larger than the remaining memory is rejected outright,
    /// nothing is partially loaded.
    pub fn load_program(&mut self, image: &[u8]) -> Chip8Result<()> {
        if image.len() > MAX_PROGRAM_SIZE {
            return Err(Chip8Error::ProgramTooLarge {
                size: image.len(),
                capacity: MAX_PROGRAM_SIZE,
            });
        }

        // Start with clean state to avoid leaking the previous program.
        self.cpu.reset();
        self.load_font();

        self.cpu.ram[MEM_START..MEM_START + image.len()].copy_from_slice(image);

        // Reset the program counter to prepare for execution.
        self.cpu.pc = MEM_START;
        self.unknown_op_count = 0;

        Ok(())
    }

    fn load_font(&mut self) {
        self.cpu.ram[FONTSET_START..FONTSET_START + FONTSET_DATA_LENGTH]
            .copy_from_slice(&FONT_DATA);
    }

    pub fn display_buffer(&self) -> Chip8DisplayBuffer {
        &self.cpu.display
    }

    pub fn registers(&self) -> &[u8; REGISTER_COUNT] {
        &self.cpu.registers
    }

    pub fn pc(&self) -> usize {
        self.cpu.pc
    }

    pub fn address_register(&self) -> Address {
        self.cpu.address
    }

    pub fn delay_timer(&self) -> u8 {
        self.cpu.delay_timer
    }

    pub fn sound_timer(&self) -> u8 {
        self.cpu.sound_timer
    }

    pub fn buzzer_state(&self) -> bool {
        self.cpu.buzzer_state
    }

    /// Whether the machine is blocked on `FX0A` waiting for a keypress.
    pub fn is_waiting_for_key(&self) -> bool {
        self.cpu.key_wait
    }

    /// Number of unmapped secondary opcodes executed as no-ops so far.
    pub fn unknown_op_count(&self) -> usize {
        self.unknown_op_count
    }
}

/// Interpreter
impl Chip8Vm {
    /// Sets the keypad key input state.
    ///
    /// Pressing an already-pressed key is a no-op. A press clears the
    /// `FX0A` wait flag so the machine can be resumed.
    pub fn set_key(&mut self, key: KeyCode, pressed: bool) {
        self.cpu.set_key_state(key as u8, pressed);
        if pressed {
            self.cpu.key_wait = false;
        }
    }

    /// Clear the keypad input state, setting all keys to up.
    pub fn clear_keys(&mut self) {
        self.cpu.clear_keys()
    }

    /// Run one instruction cycle.
    ///
    /// Faults are fatal and surface immediately; the machine should not
    /// be stepped further after an error.
    pub fn tick(&mut self) -> Chip8Result<Flow> {
        let op = self.fetch()?;

        // The counter moves past the instruction before it executes, so
        // skips, calls and returns are relative to the address of the
        // next instruction.
        self.cpu.pc += 2;

        PRIMARY[op.code() as usize](self, op)
    }

    /// Run a fixed number of instruction cycles, stopping at the first fault.
    pub fn run_steps(&mut self, step_count: usize) -> Chip8Result<Flow> {
        let mut flow = Flow::Ok;
        for _ in 0..step_count {
            flow = self.tick()?;
        }
        Ok(flow)
    }

    /// Advance the 60 Hz timer cadence by one tick.
    ///
    /// Counts down the delay and sound timers and settles the buzzer
    /// switch. The render bridge is expected to read [`Chip8Vm::display_buffer`]
    /// at this cadence. Independent of the instruction rate.
    pub fn tick_frame(&mut self) -> FrameTick {
        self.cpu.tick_delay();
        self.cpu.tick_sound();

        // Buzzer should be on while sound timer counts down,
        // then turned off when the timer reaches zero.
        if self.cpu.sound_timer > 0 && !self.cpu.buzzer_state {
            self.cpu.buzzer_state = true;
        } else if self.cpu.sound_timer == 0 && self.cpu.buzzer_state {
            self.cpu.buzzer_state = false;
        }

        FrameTick {
            buzzer: self.cpu.buzzer_state,
            sound_timer: self.cpu.sound_timer,
        }
    }

    /// Read the two instruction bytes at the program counter, big-endian.
    ///
    /// Running past the end of memory halts with an error rather than
    /// wrapping around.
    fn fetch(&self) -> Chip8Result<Opcode> {
        let pc = self.cpu.pc;
        if pc + 1 >= MEM_SIZE {
            return Err(Chip8Error::MemoryOutOfBounds { address: pc });
        }
        Ok(Opcode::from_bytes(self.cpu.ram[pc], self.cpu.ram[pc + 1]))
    }
}

/// Instruction handlers
impl Chip8Vm {
    /// Fallback for secondary codes with no mapped operation.
    ///
    /// Defined as a no-op so malformed programs keep running, but
    /// counted and logged so they stay observable.
    fn op_unmapped(&mut self, op: Opcode) -> Chip8Result<Flow> {
        self.unknown_op_count += 1;
        log::warn!(
            "unmapped opcode {op} at 0x{:04X}",
            self.cpu.pc.wrapping_sub(2)
        );
        Ok(Flow::Ok)
    }

    /// 0NNN family: clear screen, return, and the unused machine routines.
    fn op_sys(&mut self, op: Opcode) -> Chip8Result<Flow> {
        match op.nn() {
            // 00E0 (CLS)
            //
            // Clear display
            0xE0 => {
                op_trace("CLS", &self.cpu);

                self.cpu.clear_display();
                Ok(Flow::Draw)
            }
            // 00EE (RET)
            //
            // Return from a subroutine.
            // Set the program counter to the value at the top of the stack.
            0xEE => {
                op_trace("RET", &self.cpu);

                if self.cpu.sp == 0 {
                    return Err(Chip8Error::StackUnderflow);
                }
                self.cpu.sp -= 1;
                self.cpu.pc = self.cpu.stack[self.cpu.sp] as usize;
                Ok(Flow::Jump)
            }
            // 0NNN (SYS addr)
            //
            // Native machine routines are not part of the virtual machine.
            _ => self.op_unmapped(op),
        }
    }

    // 1NNN (JP addr)
    //
    // Jump to address.
    fn op_jump(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_nnn("JP", &self.cpu, op);

        self.cpu.pc = op.nnn() as usize;
        Ok(Flow::Jump)
    }

    // 2NNN (CALL addr)
    //
    // Call subroutine at NNN, pushing the return address.
    fn op_call(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_nnn("CALL", &self.cpu, op);

        if self.cpu.sp >= STACK_SIZE {
            return Err(Chip8Error::StackOverflow);
        }
        self.cpu.stack[self.cpu.sp] = self.cpu.pc as Address;
        self.cpu.sp += 1;
        self.cpu.pc = op.nnn() as usize;
        Ok(Flow::Jump)
    }

    // 3XNN (SE Vx, byte)
    //
    // Skip the next instruction if register VX equals value NN.
    fn op_skip_eq_nn(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xnn("SE", &self.cpu, op);

        if self.cpu.registers[op.x() as usize] == op.nn() {
            self.cpu.pc += 2;
        }
        Ok(Flow::Ok)
    }

    // 4XNN (SNE Vx, byte)
    //
    // Skip the next instruction if register VX does not equal value NN.
    fn op_skip_ne_nn(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xnn("SNE", &self.cpu, op);

        if self.cpu.registers[op.x() as usize] != op.nn() {
            self.cpu.pc += 2;
        }
        Ok(Flow::Ok)
    }

    // 5XY0 (SE Vx, Vy)
    //
    // Skip the next instruction if register VX equals register VY.
    fn op_skip_eq_xy(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xy("SE", &self.cpu, op);

        if self.cpu.registers[op.x() as usize] == self.cpu.registers[op.y() as usize] {
            self.cpu.pc += 2;
        }
        Ok(Flow::Ok)
    }

    // 6XNN (LD Vx, byte)
    //
    // Set register VX to value NN.
    fn op_load_nn(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xnn("LD", &self.cpu, op);

        self.cpu.registers[op.x() as usize] = op.nn();
        Ok(Flow::Ok)
    }

    // 7XNN (ADD Vx, byte)
    //
    // Add value NN to register VX. Wraps; the carry flag is not set.
    fn op_add_nn(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xnn("ADD", &self.cpu, op);

        let vx = op.x() as usize;
        self.cpu.registers[vx] = self.cpu.registers[vx].wrapping_add(op.nn());
        Ok(Flow::Ok)
    }

    /// 8XYN family, re-dispatched on the low nibble.
    fn op_math(&mut self, op: Opcode) -> Chip8Result<Flow> {
        MATH[op.n() as usize](self, op)
    }

    // 9XY0 (SNE Vx, Vy)
    //
    // Skip the next instruction if register VX does not equal register VY.
    fn op_skip_ne_xy(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xy("SNE", &self.cpu, op);

        if self.cpu.registers[op.x() as usize] != self.cpu.registers[op.y() as usize] {
            self.cpu.pc += 2;
        }
        Ok(Flow::Ok)
    }

    // ANNN (LD I, addr)
    //
    // Set address register I to value NNN.
    fn op_load_address(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_nnn("LD I", &self.cpu, op);

        self.cpu.address = op.nnn();
        Ok(Flow::Ok)
    }

    // BNNN (JP V0, addr)
    //
    // Jump to address NNN plus the value of register V0.
    fn op_jump_offset(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_nnn("JP V0", &self.cpu, op);

        self.cpu.pc = op.nnn() as usize + self.cpu.registers[0] as usize;
        Ok(Flow::Jump)
    }

    // CXNN (RND Vx, byte)
    //
    // Set register VX to the bitwise AND of a random byte and NN.
    fn op_random(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xnn("RND", &self.cpu, op);

        self.cpu.registers[op.x() as usize] = op.nn() & self.rng.gen::<u8>();
        Ok(Flow::Ok)
    }

    // DXYN (DRW Vx, Vy, nibble)
    //
    // Draw sprite to the display buffer, at coordinate as per registers VX and VY.
    // Sprite is encoded as 8 pixels wide, N pixels high, stored in bits located in
    // memory pointed to by address register I.
    //
    // If the sprite is drawn outside of the display area, it is wrapped around to
    // the other side.
    //
    // If the drawing operation erases existing pixels in the display buffer,
    // register VF is set to 1, and set to 0 if no display bits are unset. This is
    // used for collision detection.
    fn op_draw(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xyn("DRW", &self.cpu, op);

        let x0 = self.cpu.registers[op.x() as usize] as usize & DISPLAY_WIDTH_MASK;
        let y0 = self.cpu.registers[op.y() as usize] as usize & DISPLAY_HEIGHT_MASK;
        let rows = op.n() as usize;
        let addr = self.cpu.address as usize;

        if addr + rows > MEM_SIZE {
            return Err(Chip8Error::MemoryOutOfBounds {
                address: addr + rows - 1,
            });
        }

        let mut is_erased = false;

        for r in 0..rows {
            // Each row is 8 bits representing the 8 pixels of the sprite.
            let row = self.cpu.ram[addr + r];
            for c in 0..8 {
                let d = ((x0 + c) & DISPLAY_WIDTH_MASK)
                    + ((y0 + r) & DISPLAY_HEIGHT_MASK) * DISPLAY_WIDTH;

                let old_px = self.cpu.display[d];
                let new_px = (row >> (7 - c)) & 1 != 0;

                // XOR erases a pixel when both the old and new values are 1.
                is_erased |= old_px && new_px;

                self.cpu.display[d] = old_px ^ new_px;
            }
        }

        // If a pixel was erased, then a collision occurred.
        self.cpu.registers[0xF] = is_erased as u8;
        Ok(Flow::Draw)
    }

    /// EXNN family: keypad skips.
    fn op_input(&mut self, op: Opcode) -> Chip8Result<Flow> {
        match op.nn() {
            // EX9E (SKP Vx)
            //
            // Skip the next instruction if the key with the value of VX is pressed.
            0x9E => {
                op_trace("SKP", &self.cpu);

                if self.cpu.key_state(self.cpu.registers[op.x() as usize]) {
                    self.cpu.pc += 2;
                }
                Ok(Flow::Ok)
            }
            // EXA1 (SKNP Vx)
            //
            // Skip the next instruction if the key with the value of VX is not pressed.
            0xA1 => {
                op_trace("SKNP", &self.cpu);

                if !self.cpu.key_state(self.cpu.registers[op.x() as usize]) {
                    self.cpu.pc += 2;
                }
                Ok(Flow::Ok)
            }
            _ => self.op_unmapped(op),
        }
    }

    /// FXNN family, re-dispatched on the full NN byte.
    fn op_misc(&mut self, op: Opcode) -> Chip8Result<Flow> {
        MISC[op.nn() as usize](self, op)
    }
}

/// Arithmetic handlers (8XYN)
///
/// VF is written after the result so it stays the authoritative flag
/// even when X or Y is F.
impl Chip8Vm {
    // 8XY0 (LD Vx, Vy)
    //
    // Store the value of register VY in register VX.
    fn op_math_load(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xy_op("LD", &self.cpu, op);

        self.cpu.registers[op.x() as usize] = self.cpu.registers[op.y() as usize];
        Ok(Flow::Ok)
    }

    // 8XY1 (OR Vx, Vy)
    //
    // Performs bitwise OR on VX and VY, and stores the result in VX.
    fn op_math_or(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xy_op("OR", &self.cpu, op);

        self.cpu.registers[op.x() as usize] |= self.cpu.registers[op.y() as usize];
        Ok(Flow::Ok)
    }

    // 8XY2 (AND Vx, Vy)
    //
    // Performs bitwise AND on VX and VY, and stores the result in VX.
    fn op_math_and(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xy_op("AND", &self.cpu, op);

        self.cpu.registers[op.x() as usize] &= self.cpu.registers[op.y() as usize];
        Ok(Flow::Ok)
    }

    // 8XY3 (XOR Vx, Vy)
    //
    // Performs bitwise XOR on VX and VY, and stores the result in VX.
    fn op_math_xor(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xy_op("XOR", &self.cpu, op);

        self.cpu.registers[op.x() as usize] ^= self.cpu.registers[op.y() as usize];
        Ok(Flow::Ok)
    }

    // 8XY4 (ADD Vx, Vy)
    //
    // Adds VY to VX, and stores the result in VX.
    // Overflow is wrapped. If overflow, set VF to 1, else 0.
    fn op_math_add(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xy_op("ADD", &self.cpu, op);

        let (vx, vy) = (op.x() as usize, op.y() as usize);
        let (x, y) = (self.cpu.registers[vx], self.cpu.registers[vy]);
        let (result, carry) = x.overflowing_add(y);
        self.cpu.registers[vx] = result;
        self.cpu.registers[0xF] = carry as u8;
        Ok(Flow::Ok)
    }

    // 8XY5 (SUB Vx, Vy)
    //
    // Subtracts VY from VX, and stores the result in VX.
    // Wraps on borrow. VF is set to 1 when VX is strictly greater than VY, else 0.
    fn op_math_sub(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xy_op("SUB", &self.cpu, op);

        let (vx, vy) = (op.x() as usize, op.y() as usize);
        let (x, y) = (self.cpu.registers[vx], self.cpu.registers[vy]);
        self.cpu.registers[vx] = x.wrapping_sub(y);
        self.cpu.registers[0xF] = (x > y) as u8;
        Ok(Flow::Ok)
    }

    // 8XY6 (SHR Vx)
    //
    // If the least-significant bit of the source is 1, VF is set to 1, otherwise 0.
    // Shift the source right by 1 and store the result in VX.
    //
    // The source is VX, with VY unused, unless the shift quirk is enabled.
    fn op_math_shr(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xy_op("SHR", &self.cpu, op);

        let src = if self.conf.quirks.shift_reads_vy {
            op.y()
        } else {
            op.x()
        };
        let value = self.cpu.registers[src as usize];
        self.cpu.registers[op.x() as usize] = value >> 1;
        self.cpu.registers[0xF] = value & 1;
        Ok(Flow::Ok)
    }

    // 8XY7 (SUBN Vx, Vy)
    //
    // Subtracts VX from VY, and stores the result in VY.
    // Wraps on borrow. VF is set to 1 when VY is strictly greater than VX, else 0.
    fn op_math_subn(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xy_op("SUBN", &self.cpu, op);

        let (vx, vy) = (op.x() as usize, op.y() as usize);
        let (x, y) = (self.cpu.registers[vx], self.cpu.registers[vy]);
        self.cpu.registers[vy] = y.wrapping_sub(x);
        self.cpu.registers[0xF] = (y > x) as u8;
        Ok(Flow::Ok)
    }

    // 8XYE (SHL Vx)
    //
    // If the most-significant bit of the source is 1, VF is set to 1, otherwise 0.
    // Shift the source left by 1 and store the result in VX.
    //
    // The source is VX, with VY unused, unless the shift quirk is enabled.
    fn op_math_shl(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xy_op("SHL", &self.cpu, op);

        let src = if self.conf.quirks.shift_reads_vy {
            op.y()
        } else {
            op.x()
        };
        let value = self.cpu.registers[src as usize];
        self.cpu.registers[op.x() as usize] = value << 1;
        self.cpu.registers[0xF] = (value >> 7) & 1;
        Ok(Flow::Ok)
    }
}

/// Miscellaneous handlers (FXNN)
impl Chip8Vm {
    // FX07 (LD Vx, DT)
    //
    // Set VX to the delay timer value.
    fn op_load_delay(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xk("LD", &self.cpu, op, "DT");

        self.cpu.registers[op.x() as usize] = self.cpu.delay_timer;
        Ok(Flow::Ok)
    }

    // FX0A (LD Vx, K)
    //
    // Wait for a keypress, then store the key value in VX.
    //
    // When no key is down the program counter is rewound so the same
    // instruction runs again next cycle, a busy-wait at the host loop's
    // tick granularity rather than a blocking call. The lowest pressed
    // key code is latched when several are held.
    fn op_key_wait(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xk("LD", &self.cpu, op, "K");

        if let Some(key) = self.cpu.first_key() {
            self.cpu.registers[op.x() as usize] = key;
            self.cpu.key_wait = false;
            Ok(Flow::Ok)
        } else {
            // rewind the program counter to stall the machine
            self.cpu.pc -= 2;
            self.cpu.key_wait = true;
            Ok(Flow::KeyWait)
        }
    }

    // FX15 (LD DT, Vx)
    //
    // Set the delay timer to VX.
    fn op_set_delay(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_kx("LD", &self.cpu, op, "DT");

        self.cpu.delay_timer = self.cpu.registers[op.x() as usize];
        Ok(Flow::Ok)
    }

    // FX18 (LD ST, Vx)
    //
    // Set the sound timer to VX. The buzzer sounds while the timer
    // counts down on the 60 Hz tick; this is a request, not a blocking
    // audio call.
    fn op_set_sound(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_kx("LD", &self.cpu, op, "ST");

        self.cpu.sound_timer = self.cpu.registers[op.x() as usize];
        self.cpu.buzzer_state = self.cpu.sound_timer > 0;
        Ok(Flow::Sound)
    }

    // FX1E (ADD I, Vx)
    //
    // Add VX to address register I.
    fn op_add_address(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_kx("ADD", &self.cpu, op, "I");

        let x = self.cpu.registers[op.x() as usize] as Address;
        self.cpu.address = self.cpu.address.wrapping_add(x);
        Ok(Flow::Ok)
    }

    // FX29 (LD F, Vx)
    //
    // Set I to the address of the font glyph for the digit in VX.
    fn op_font_glyph(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_kx("LD", &self.cpu, op, "F");

        let x = self.cpu.registers[op.x() as usize];
        self.cpu.address = FONTSET_START as Address + x as Address * FONTSET_HEIGHT as Address;
        Ok(Flow::Ok)
    }

    // FX33 (LD B, Vx)
    //
    // Store the binary-coded decimal representation of VX
    // in the memory locations I, I+1, and I+2.
    #[rustfmt::skip]
    fn op_bcd(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_kx("LD", &self.cpu, op, "B");

        let addr = self.cpu.address as usize;
        if addr + 3 > MEM_SIZE {
            return Err(Chip8Error::MemoryOutOfBounds { address: addr + 2 });
        }

        let x = self.cpu.registers[op.x() as usize];
        self.cpu.ram[addr]     = x / 100 % 10;
        self.cpu.ram[addr + 1] = x / 10  % 10;
        self.cpu.ram[addr + 2] = x       % 10;
        Ok(Flow::Ok)
    }

    // FX55 (LD [I], Vx)
    //
    // Store registers V0 through VX inclusive in memory starting at location I.
    fn op_store_registers(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_kx("LD", &self.cpu, op, "[I]");

        let addr = self.cpu.address as usize;
        let count = op.x() as usize + 1;
        if addr + count > MEM_SIZE {
            return Err(Chip8Error::MemoryOutOfBounds {
                address: addr + count - 1,
            });
        }

        self.cpu.ram[addr..addr + count].copy_from_slice(&self.cpu.registers[..count]);
        Ok(Flow::Ok)
    }

    // FX65 (LD Vx, [I])
    //
    // Read registers V0 through VX inclusive from memory starting at location I.
    fn op_load_registers(&mut self, op: Opcode) -> Chip8Result<Flow> {
        op_trace_xk("LD", &self.cpu, op, "[I]");

        let addr = self.cpu.address as usize;
        let count = op.x() as usize + 1;
        if addr + count > MEM_SIZE {
            return Err(Chip8Error::MemoryOutOfBounds {
                address: addr + count - 1,
            });
        }

        self.cpu.registers[..count].copy_from_slice(&self.cpu.ram[addr..addr + count]);
        Ok(Flow::Ok)
    }
}

/// Troubleshooting
#[allow(dead_code)]
#[doc(hidden)]
impl Chip8Vm {
    /// Returns the contents of the program memory as a human readable string.
    pub fn dump_ram(&self, count: usize) -> Result<String, fmt::Error> {
        let iter = self
            .cpu
            .ram
            .iter()
            .enumerate()
            .skip(MEM_START)
            .take(count)
            .step_by(2);
        let mut buf = String::new();

        for (i, op) in iter {
            writeln!(buf, "{:04X}: {:02X}{:02X}", i, op, self.cpu.ram[i + 1])?;
        }

        Ok(buf)
    }

    pub fn dump_display(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();

        for y in 0..DISPLAY_HEIGHT {
            for x in 0..DISPLAY_WIDTH {
                if self.cpu.display[x + y * DISPLAY_WIDTH] {
                    write!(buf, "#")?;
                } else {
                    write!(buf, ".")?;
                }
            }
            writeln!(buf)?;
        }

        Ok(buf)
    }

    pub fn dump_keys(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();

        if self.cpu.any_key() {
            write!(buf, "keys: ")?;
            for i in 0..KEY_COUNT {
                if self.cpu.key_state(i) {
                    write!(buf, "k{i:x}")?;
                }
            }
        }

        Ok(buf)
    }
}

#[cfg(feature = "op_trace")]
#[inline]
fn op_trace(name: &str, cpu: &Chip8Cpu) {
    log::trace!("{:04X}: {:4}", cpu.pc, name);
}

#[cfg(feature = "op_trace")]
#[inline]
fn op_trace_nnn(name: &str, cpu: &Chip8Cpu, op: Opcode) {
    log::trace!("{:04X}: {:4} {:03X}", cpu.pc, name, op.nnn());
}

#[cfg(feature = "op_trace")]
#[inline]
fn op_trace_xnn(name: &str, cpu: &Chip8Cpu, op: Opcode) {
    log::trace!("{:04X}: {:4} V{:02X} {:02X}", cpu.pc, name, op.x(), op.nn());
}

#[cfg(feature = "op_trace")]
#[inline]
fn op_trace_xyn(name: &str, cpu: &Chip8Cpu, op: Opcode) {
    log::trace!(
        "{:04X}: {:4} V{:02X} V{:02X} {:01X}",
        cpu.pc,
        name,
        op.x(),
        op.y(),
        op.n()
    );
}

#[cfg(feature = "op_trace")]
#[inline]
fn op_trace_xy(name: &str, cpu: &Chip8Cpu, op: Opcode) {
    log::trace!("{:04X}: {:4} V{:02X} V{:02X}", cpu.pc, name, op.x(), op.y());
}

#[cfg(feature = "op_trace")]
#[inline]
fn op_trace_xy_op(name: &str, cpu: &Chip8Cpu, op: Opcode) {
    log::trace!(
        "{:04X}: {:4} V{:02X} V{:02X} {:02X}",
        cpu.pc,
        name,
        op.x(),
        op.y(),
        op.n()
    );
}

#[cfg(feature = "op_trace")]
#[inline]
fn op_trace_xk(name: &str, cpu: &Chip8Cpu, op: Opcode, k: &str) {
    log::trace!("{:04X}: {:4} V{:02X} {}", cpu.pc, name, op.x(), k);
}

#[cfg(feature = "op_trace")]
#[inline]
fn op_trace_kx(name: &str, cpu: &Chip8Cpu, op: Opcode, k: &str) {
    log::trace!("{:04X}: {:4} {} V{:02X}", cpu.pc, name, k, op.x());
}

#[cfg(not(feature = "op_trace"))]
#[inline]
fn op_trace(_: &str, _: &Chip8Cpu) {}

#[cfg(not(feature = "op_trace"))]
#[inline]
fn op_trace_nnn(_: &str, _: &Chip8Cpu, _: Opcode) {}

#[cfg(not(feature = "op_trace"))]
#[inline]
fn op_trace_xnn(_: &str, _: &Chip8Cpu, _: Opcode) {}

#[cfg(not(feature = "op_trace"))]
#[inline]
fn op_trace_xyn(_: &str, _: &Chip8Cpu, _: Opcode) {}

#[cfg(not(feature = "op_trace"))]
#[inline]
fn op_trace_xy(_: &str, _: &Chip8Cpu, _: Opcode) {}

#[cfg(not(feature = "op_trace"))]
#[inline]
fn op_trace_xy_op(_: &str, _: &Chip8Cpu, _: Opcode) {}

#[cfg(not(feature = "op_trace"))]
#[inline]
fn op_trace_xk(_: &str, _: &Chip8Cpu, _: Opcode, _: &str) {}

#[cfg(not(feature = "op_trace"))]
#[inline]
fn op_trace_kx(_: &str, _: &Chip8Cpu, _: Opcode, _: &str) {}
