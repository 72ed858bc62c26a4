//! End-to-end properties of the virtual machine, driven through the
//! public API the way a host loop would.
use chip8_vm::constants::*;
use chip8_vm::prelude::*;

fn new_vm(program: &[u8]) -> Chip8Vm {
    let mut vm = Chip8Vm::new(Chip8Conf {
        rng_seed: Some(0xC8),
        ..Default::default()
    });
    vm.load_program(program).unwrap();
    vm
}

#[test]
#[rustfmt::skip]
fn test_load_then_add() {
    let mut vm = new_vm(&[
        0x60, 0x05, // LD  V0, 5
        0x70, 0x03, // ADD V0, 3
    ]);

    vm.run_steps(2).unwrap();

    assert_eq!(vm.registers()[0], 8);
    assert_eq!(vm.pc(), MEM_START + 4);
}

#[test]
#[rustfmt::skip]
fn test_clear_display_after_draw() {
    let mut vm = new_vm(&[
        0xA0, 0x00, // LD  I, 0x000  ; glyph for digit 0
        0x60, 0x00, // LD  V0, 0
        0x61, 0x00, // LD  V1, 0
        0xD0, 0x15, // DRW V0, V1, 5
        0x00, 0xE0, // CLS
    ]);

    assert_eq!(vm.run_steps(4).unwrap(), Flow::Draw);
    assert!(vm.display_buffer().iter().any(|px| *px));

    assert_eq!(vm.tick().unwrap(), Flow::Draw);
    assert!(vm.display_buffer().iter().all(|px| !*px));
}

/// A sprite drawn straddling the right and bottom edge wraps around to
/// the opposite side instead of clipping.
#[test]
#[rustfmt::skip]
fn test_sprite_wraps_at_edges() {
    let mut vm = new_vm(&[
        0xA2, 0x0C, // LD  I, 0x20C  ; sprite data below
        0x60, 0x3C, // LD  V0, 60
        0x61, 0x1F, // LD  V1, 31
        0xD0, 0x11, // DRW V0, V1, 1
        0xD0, 0x11, // DRW V0, V1, 1
        0x00, 0x00, // padding
        0xFF, 0x00, // sprite: ########
    ]);

    assert_eq!(vm.run_steps(4).unwrap(), Flow::Draw);
    assert_eq!(vm.registers()[0xF], 0);

    let display = vm.display_buffer();
    let bottom_row = 31 * DISPLAY_WIDTH;
    for x in [60, 61, 62, 63, 0, 1, 2, 3] {
        assert!(display[bottom_row + x], "pixel x={x} not lit");
    }

    // Redrawing the same sprite erases every pixel and flags a collision.
    assert_eq!(vm.tick().unwrap(), Flow::Draw);
    assert_eq!(vm.registers()[0xF], 1);
    assert!(vm.display_buffer().iter().all(|px| !*px));
}

/// Calling then returning restores the program counter to the address
/// after the call, at any nesting depth up to the stack limit.
#[test]
#[rustfmt::skip]
fn test_call_return_roundtrip() {
    let mut vm = new_vm(&[
        0x22, 0x04, // 0x200: CALL 0x204
        0x00, 0x00, // 0x202: padding
        0x00, 0xEE, // 0x204: RET
    ]);

    assert_eq!(vm.tick().unwrap(), Flow::Jump);
    assert_eq!(vm.pc(), 0x204);
    assert_eq!(vm.tick().unwrap(), Flow::Jump);
    assert_eq!(vm.pc(), 0x202);
}

/// Sixteen nested calls fill the stack; the seventeenth is a fault.
#[test]
fn test_call_stack_overflow() {
    // A chain of 17 CALL instructions, each targeting the next.
    let mut program = Vec::new();
    for k in 0..17u16 {
        let target = 0x202 + k * 2;
        program.push(0x20 | (target >> 8) as u8);
        program.push(target as u8);
    }
    let mut vm = new_vm(&program);

    for _ in 0..16 {
        assert_eq!(vm.tick().unwrap(), Flow::Jump);
    }
    assert_eq!(vm.tick(), Err(Chip8Error::StackOverflow));
}

#[test]
fn test_return_stack_underflow() {
    let mut vm = new_vm(&[0x00, 0xEE]); // RET with an empty stack
    assert_eq!(vm.tick(), Err(Chip8Error::StackUnderflow));
}

/// Fx0A (LD Vx, K)
///
/// Wait for a keypress, then store the key value in Vx.
/// The VM must stall while waiting, and signal the state to the caller.
#[test]
#[rustfmt::skip]
fn test_key_wait() {
    let mut vm = new_vm(&[
        0xF1, 0x0A, // LD V1, K
        0x62, 0x42, // LD V2, 0x42  ; sentinel
    ]);

    // machine must stall
    for _ in 0..6 {
        assert_eq!(vm.tick().unwrap(), Flow::KeyWait);
        assert_eq!(vm.pc(), MEM_START);
        assert!(vm.is_waiting_for_key());
    }

    // machine has yielded, waiting for any key to be pressed.
    vm.set_key(KeyCode::Key5, true);
    assert!(!vm.is_waiting_for_key());

    // machine will now advance
    vm.tick().unwrap();
    assert_eq!(vm.pc(), MEM_START + 2);
    assert_eq!(vm.registers()[1], 0x05);

    // Ensure the machine is continuing
    vm.tick().unwrap();
    assert_eq!(vm.pc(), MEM_START + 4);
    assert_eq!(vm.registers()[2], 0x42); // sentinel
}

/// The lowest pressed key code is latched when several keys are held.
#[test]
fn test_key_wait_latches_lowest() {
    let mut vm = new_vm(&[0xF0, 0x0A]); // LD V0, K

    vm.set_key(KeyCode::KeyC, true);
    vm.set_key(KeyCode::Key7, true);
    vm.tick().unwrap();
    assert_eq!(vm.registers()[0], 0x7);
}

#[test]
#[rustfmt::skip]
fn test_skip_on_key() {
    let mut vm = new_vm(&[
        0x61, 0x05, // LD  V1, 5
        0xE1, 0x9E, // SKP V1
        0x00, 0x00, // skipped when key 5 is down
        0xE1, 0xA1, // SKNP V1
    ]);

    vm.set_key(KeyCode::Key5, true);
    vm.run_steps(2).unwrap();
    assert_eq!(vm.pc(), MEM_START + 6);

    // Key is down, so SKNP does not skip.
    vm.tick().unwrap();
    assert_eq!(vm.pc(), MEM_START + 8);

    vm.set_key(KeyCode::Key5, false);
    assert_eq!(vm.dump_keys().unwrap(), "");
}

/// Timers count down on the 60 Hz tick, independent of instruction rate.
#[test]
#[rustfmt::skip]
fn test_timers_decoupled_from_instructions() {
    let mut vm = new_vm(&[
        0x60, 0x02, // LD V0, 2
        0xF0, 0x15, // LD DT, V0
        0xF0, 0x18, // LD ST, V0
        0x12, 0x06, // JP 0x206  ; spin
    ]);

    vm.run_steps(3).unwrap();
    assert_eq!(vm.delay_timer(), 2);
    assert_eq!(vm.sound_timer(), 2);
    assert!(vm.buzzer_state());

    // Instruction ticks alone do not touch the timers.
    vm.run_steps(10).unwrap();
    assert_eq!(vm.delay_timer(), 2);
    assert_eq!(vm.sound_timer(), 2);

    let frame = vm.tick_frame();
    assert_eq!(frame.sound_timer, 1);
    assert!(frame.buzzer);

    let frame = vm.tick_frame();
    assert_eq!(frame.sound_timer, 0);
    assert!(!frame.buzzer);
    assert_eq!(vm.delay_timer(), 0);
}
