//! VM-level integration tests: hand-assembled programs driven through the
//! assembler into the terp, exercising branches, subroutines, the stack,
//! and the out-of-memory trap.

use basecode::vm::{
    Assembler, InstructionBlockType, OpCode, OpSize, Terp,
};
use basecode::{IdPool, SessionResult};
use std::cell::Cell;
use std::rc::Rc;

fn new_terp() -> (Terp, SessionResult) {
    let mut result = SessionResult::new();
    let mut terp = Terp::new(1024 * 128, 1024 * 16);
    assert!(terp.initialize(&mut result));
    (terp, result)
}

#[test]
fn test_countdown_loop() {
    let (mut terp, mut result) = new_terp();
    let mut assembler = Assembler::new();
    let mut ids = IdPool::new();

    // I0 = 5; I1 = 0; while (I0 != 0) { I1 += I0; I0 -= 1 }
    {
        let block = assembler.current_block();
        block.make_label("_start");
        block.move_constant_to_ireg(OpSize::Qword, 0, 5);
        block.move_constant_to_ireg(OpSize::Qword, 1, 0);
        block.move_constant_to_ireg(OpSize::Qword, 2, 1);
        block.make_label("loop");
        block.branch_if_zero(&mut ids, 0, "done");
        block.alu_ireg(OpCode::Add, OpSize::Qword, 1, 1, 0);
        block.alu_ireg(OpCode::Sub, OpSize::Qword, 0, 0, 2);
        block.jump_direct(&mut ids, "loop");
        block.make_label("done");
        block.exit();
    }
    assert!(assembler.assemble(&mut result, &mut terp, "_start"));
    assert!(terp.run(&mut result), "run failed: {}", result);
    assert_eq!(terp.register_file().i[1], 15);
    assert_eq!(terp.register_file().i[0], 0);
}

#[test]
fn test_jsr_rts_round_trip() {
    let (mut terp, mut result) = new_terp();
    let mut assembler = Assembler::new();
    let mut ids = IdPool::new();

    {
        let block = assembler.current_block();
        block.make_label("_start");
        block.move_constant_to_ireg(OpSize::Qword, 0, 20);
        block.call(&mut ids, "double");
        block.exit();
    }
    let subroutine = assembler.make_block(InstructionBlockType::Procedure);
    assembler.push_block(subroutine);
    {
        let block = assembler.current_block();
        block.make_label("double");
        block.alu_ireg(OpCode::Add, OpSize::Qword, 0, 0, 0);
        block.rts();
    }
    assembler.pop_block();

    assert!(assembler.assemble(&mut result, &mut terp, "_start"));
    assert!(terp.run(&mut result), "run failed: {}", result);
    assert_eq!(terp.register_file().i[0], 40);
}

#[test]
fn test_flag_driven_branches() {
    let (mut terp, mut result) = new_terp();
    let mut assembler = Assembler::new();
    let mut ids = IdPool::new();

    // I2 = (I0 > I1) ? 1 : 0, with I0=9, I1=4
    {
        let block = assembler.current_block();
        block.make_label("_start");
        block.move_constant_to_ireg(OpSize::Qword, 0, 9);
        block.move_constant_to_ireg(OpSize::Qword, 1, 4);
        block.cmp_ireg(OpSize::Qword, 0, 1);
        block.branch_on_flags(&mut ids, OpCode::Bg, "greater");
        block.move_constant_to_ireg(OpSize::Qword, 2, 0);
        block.jump_direct(&mut ids, "end");
        block.make_label("greater");
        block.move_constant_to_ireg(OpSize::Qword, 2, 1);
        block.make_label("end");
        block.exit();
    }
    assert!(assembler.assemble(&mut result, &mut terp, "_start"));
    assert!(terp.run(&mut result), "run failed: {}", result);
    assert_eq!(terp.register_file().i[2], 1);
}

#[test]
fn test_stack_push_pop_program() {
    let (mut terp, mut result) = new_terp();
    let mut assembler = Assembler::new();

    {
        let block = assembler.current_block();
        block.make_label("_start");
        block.push_constant(OpSize::Qword, 11);
        block.push_constant(OpSize::Qword, 22);
        block.pop_ireg(OpSize::Qword, 0);
        block.pop_ireg(OpSize::Qword, 1);
        block.exit();
    }
    assert!(assembler.assemble(&mut result, &mut terp, "_start"));
    assert!(terp.run(&mut result), "run failed: {}", result);
    // LIFO: the last push pops first
    assert_eq!(terp.register_file().i[0], 22);
    assert_eq!(terp.register_file().i[1], 11);
}

#[test]
fn test_out_of_memory_trap() {
    let (mut terp, mut result) = new_terp();
    let mut assembler = Assembler::new();

    let fired = Rc::new(Cell::new(false));
    let observer = Rc::clone(&fired);
    terp.register_trap(
        basecode::vm::terp::TRAP_OUT_OF_MEMORY,
        Box::new(move |_registers| observer.set(true)),
    );

    {
        let block = assembler.current_block();
        block.make_label("_start");
        // request far more than the heap holds
        block.move_constant_to_ireg(OpSize::Qword, 1, u32::MAX as u64);
        block.alloc(OpSize::Byte, 0, 1);
        block.exit();
    }
    assert!(assembler.assemble(&mut result, &mut terp, "_start"));
    terp.run(&mut result);
    assert!(fired.get(), "out-of-memory trap never fired");
}

#[test]
fn test_store_load_round_trip_through_memory() {
    let (mut terp, mut result) = new_terp();
    let mut assembler = Assembler::new();

    // reserve a data slot, store through a register, and load it back
    {
        let segment = assembler.segment(
            "data",
            basecode::vm::assembler::SegmentType::Data,
        );
        segment.symbol(
            "slot",
            basecode::vm::assembler::SymbolType::U64,
            0,
        );
    }
    let mut ids = IdPool::new();
    {
        let block = assembler.current_block();
        block.make_label("_start");
        block.move_label_to_ireg(&mut ids, 0, "slot");
        block.move_constant_to_ireg(OpSize::Qword, 1, 0xABCD);
        block.store_from_ireg(OpSize::Qword, 0, 1, 0);
        block.load_to_ireg(OpSize::Qword, 2, 0, 0);
        block.exit();
    }
    assert!(assembler.assemble(&mut result, &mut terp, "_start"));
    assert!(terp.run(&mut result), "run failed: {}", result);
    assert_eq!(terp.register_file().i[2], 0xABCD);
}

#[test]
fn test_pc_stays_aligned_during_execution() {
    let (mut terp, mut result) = new_terp();
    let mut assembler = Assembler::new();
    let mut ids = IdPool::new();

    {
        let block = assembler.current_block();
        block.make_label("_start");
        block.move_constant_to_ireg(OpSize::Byte, 0, 1);
        block.nop();
        block.jump_direct(&mut ids, "finish");
        block.nop();
        block.make_label("finish");
        block.exit();
    }
    assert!(assembler.assemble(&mut result, &mut terp, "_start"));
    loop {
        assert_eq!(terp.register_file().pc % 4, 0);
        if !terp.step(&mut result) {
            break;
        }
    }
    assert!(terp.has_exited());
    assert!(!result.is_failed(), "{}", result);
}
