//! End-to-end tests: compile, assemble, and execute whole programs, then
//! inspect the VM heap through the assembler's symbol table.

use basecode::compiler::{Session, SessionOptions};
use basecode::vm::instruction::OpSize;

/// Compile and run a program, panicking (with diagnostics) on failure.
fn compile_and_run(source: &str) -> Session {
    let mut session = Session::new(SessionOptions::default());
    session.add_source("test.bc", source);
    assert!(
        session.compile(),
        "compile failed:\n{}",
        session.result(),
    );
    assert!(session.run(), "run failed:\n{}", session.result());
    session
}

fn read_u32_symbol(session: &Session, name: &str) -> u32 {
    let address = session
        .assembler()
        .symbol_address(name)
        .unwrap_or_else(|| panic!("no symbol named {}", name));
    session.terp().read_sized(OpSize::Dword, address) as u32
}

fn read_f64_symbol(session: &Session, name: &str) -> f64 {
    let address = session
        .assembler()
        .symbol_address(name)
        .unwrap_or_else(|| panic!("no symbol named {}", name));
    f64::from_bits(session.terp().read_u64(address))
}

#[test]
fn test_numeric_declaration_and_assignment() {
    let session = compile_and_run(
        "x: u32 := 10;\n\
         x := x + 5;",
    );
    assert_eq!(read_u32_symbol(&session, "x"), 15);
}

#[test]
fn test_arithmetic_chain() {
    let session = compile_and_run(
        "a: u32 := 6;\n\
         b: u32 := 7;\n\
         c: u32 := 0;\n\
         c := a * b + 1;",
    );
    assert_eq!(read_u32_symbol(&session, "c"), 43);
}

#[test]
fn test_constant_declaration_lands_in_constant_segment() {
    let session = compile_and_run("limit :: 640;");
    let segment = session
        .assembler()
        .segments()
        .iter()
        .find(|segment| segment.name == "constant")
        .expect("constant segment");
    assert!(segment.find_symbol("limit").is_some());
    assert_eq!(read_u32_symbol(&session, "limit"), 640);
}

#[test]
fn test_size_of_folds_to_constant() {
    let session = compile_and_run("N :: size_of(u64);");
    assert_eq!(read_u32_symbol(&session, "N"), 8);
}

#[test]
fn test_align_of_folds_to_constant() {
    let session = compile_and_run("A :: align_of(u16);");
    assert_eq!(read_u32_symbol(&session, "A"), 2);
}

#[test]
fn test_namespace_constant_flows_into_data() {
    let session = compile_and_run(
        "math :: namespace { pi :: 3.14159; };\n\
         r := math::pi * 2.0;",
    );
    let value = read_f64_symbol(&session, "r");
    assert!((value - 6.28318).abs() < 1e-9, "r = {}", value);
}

#[test]
fn test_if_else() {
    let session = compile_and_run(
        "x: u32 := 10;\n\
         y: u32 := 0;\n\
         if x > 5 { y := 1; } else { y := 2; };",
    );
    assert_eq!(read_u32_symbol(&session, "y"), 1);
}

#[test]
fn test_if_else_chain_takes_else_branch() {
    let session = compile_and_run(
        "x: u32 := 3;\n\
         y: u32 := 0;\n\
         if x > 5 { y := 1; } else if x > 4 { y := 2; } \
         else { y := 3; };",
    );
    assert_eq!(read_u32_symbol(&session, "y"), 3);
}

#[test]
fn test_while_loop() {
    let session = compile_and_run(
        "n: u32 := 5;\n\
         total: u32 := 0;\n\
         while n > 0 {\n\
             total := total + n;\n\
             n := n - 1;\n\
         };",
    );
    assert_eq!(read_u32_symbol(&session, "total"), 15);
    assert_eq!(read_u32_symbol(&session, "n"), 0);
}

#[test]
fn test_procedure_call_with_return_value() {
    let session = compile_and_run(
        "add2 :: proc(a: u32, b: u32) -> u32 { return a + b; };\n\
         r: u32 := 0;\n\
         r := add2(3, 4);",
    );
    assert_eq!(read_u32_symbol(&session, "r"), 7);
}

#[test]
fn test_procedure_call_arguments_in_declared_order() {
    let session = compile_and_run(
        "sub2 :: proc(a: u32, b: u32) -> u32 { return a - b; };\n\
         r: u32 := 0;\n\
         r := sub2(10, 4);",
    );
    assert_eq!(read_u32_symbol(&session, "r"), 6);
}

#[test]
fn test_bitwise_operators() {
    let session = compile_and_run(
        "a: u32 := $F0;\n\
         b: u32 := $0F;\n\
         or_result: u32 := 0;\n\
         and_result: u32 := 0;\n\
         shift_result: u32 := 0;\n\
         or_result := a | b;\n\
         and_result := a & $30;\n\
         shift_result := b << 4;",
    );
    assert_eq!(read_u32_symbol(&session, "or_result"), 0xFF);
    assert_eq!(read_u32_symbol(&session, "and_result"), 0x30);
    assert_eq!(read_u32_symbol(&session, "shift_result"), 0xF0);
}

#[test]
fn test_signed_literal_declaration() {
    let session = compile_and_run(
        "x: s32 := -5;\n\
         y: s32 := 0;\n\
         y := x + 10;",
    );
    assert_eq!(read_u32_symbol(&session, "y") as i32, 5);
}

#[test]
fn test_labels_are_accepted_on_statements() {
    let session = compile_and_run(
        "n: u32 := 2;\n\
         x: u32 := 0;\n\
         countdown: while n > 0 {\n\
             x := x + n;\n\
             n := n - 1;\n\
         };",
    );
    assert_eq!(read_u32_symbol(&session, "x"), 3);
}

#[test]
fn test_runtime_alloc_and_free() {
    let session = compile_and_run(
        "p: address := 0;\n\
         p := alloc(64);\n\
         free(p);",
    );
    let address = session.assembler().symbol_address("p").unwrap();
    // the allocation landed past the program image
    let allocated = session.terp().read_u64(address);
    assert!(allocated > 0);
}

#[test]
fn test_string_data_lands_in_heap() {
    let session = compile_and_run("greeting :: \"hello\";");
    let address = session
        .assembler()
        .symbol_address("greeting")
        .expect("greeting symbol");
    let heap = session.terp().heap();
    let start = address as usize;
    assert_eq!(&heap[start..start + 5], b"hello");
    assert_eq!(heap[start + 5], 0);
}

#[test]
fn test_module_expression_compiles_nested_source() {
    let dir = std::env::temp_dir();
    let nested = dir.join("basecode_nested_module_test.bc");
    std::fs::write(&nested, "answer :: 42;\n").unwrap();

    let mut session = Session::new(SessionOptions::default());
    session.add_source(
        dir.join("basecode_root_module_test.bc"),
        "lib :: module(\"basecode_nested_module_test.bc\");",
    );
    assert!(
        session.compile(),
        "compile failed:\n{}",
        session.result(),
    );
    assert!(session.run(), "run failed:\n{}", session.result());
    assert_eq!(read_u32_symbol(&session, "answer"), 42);
}

#[test]
fn test_comments_are_ignored_at_runtime() {
    let session = compile_and_run(
        "// a counter\n\
         x: u32 := 41;\n\
         /* bump it */\n\
         x := x + 1;",
    );
    assert_eq!(read_u32_symbol(&session, "x"), 42);
}
