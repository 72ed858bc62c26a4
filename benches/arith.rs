use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chip8_vm::prelude::*;

fn criterion_benchmark(c: &mut Criterion) {
    {
        let mut vm = Chip8Vm::new(Chip8Conf {
            rng_seed: Some(0xC81E),
            ..Default::default()
        });

        #[rustfmt::skip]
        let program = [
            0x60, 0x00, // LD  V0, 0
            0x61, 0x05, // LD  V1, 5
            0x80, 0x14, // ADD V0, V1
            0xC2, 0xFF, // RND V2, FF
            0x12, 0x02, // JP  0x202
        ];
        vm.load_program(&program).unwrap();

        c.bench_function("arith loop", |b| {
            b.iter(|| {
                let step_count = black_box(1000_usize);
                black_box(vm.run_steps(step_count))
            })
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
