//! Integration tests for programs that should fail to compile. Each test
//! asserts the stable diagnostic code the failure reports.

use basecode::compiler::{Session, SessionOptions};

/// Compile a program expecting failure, and assert the given diagnostic
/// code was reported.
fn assert_compile_error(source: &str, expected_code: &str) {
    let mut session = Session::new(SessionOptions::default());
    session.add_source("test.bc", source);
    let ok = session.compile();
    assert!(
        !ok,
        "program compiled but {} was expected:\n{}",
        expected_code, source,
    );
    assert!(
        session.result().has_code(expected_code),
        "expected {}, got: {}",
        expected_code,
        session.result(),
    );
}

#[test]
fn test_unknown_type_in_cast() {
    assert_compile_error("x := cast<nosuch>(5);", "P002");
}

#[test]
fn test_unresolved_identifier() {
    assert_compile_error("x := y + 1;", "P004");
}

#[test]
fn test_unresolvable_declared_type() {
    assert_compile_error("x: phantom_t;", "P004");
}

#[test]
fn test_qualified_name_through_non_namespace() {
    assert_compile_error(
        "x :: 5;\n\
         x::y := 1;",
        "P018",
    );
}

#[test]
fn test_inference_with_nothing_to_infer_from() {
    assert_compile_error("mystery;", "P019");
}

#[test]
fn test_assignment_arity_mismatch() {
    assert_compile_error("a, b := 1;", "P027");
}

#[test]
fn test_invalid_numeric_literal() {
    assert_compile_error(
        "x := 99999999999999999999999999;",
        "P041",
    );
}

#[test]
fn test_type_mismatch_at_declaration() {
    assert_compile_error("x: u32 := \"hello\";", "C051");
}

#[test]
fn test_type_mismatch_at_assignment() {
    assert_compile_error(
        "x: u32 := 1;\n\
         x := \"oops\";",
        "C051",
    );
}

#[test]
fn test_module_load_failure() {
    assert_compile_error(
        "other :: module(\"does_not_exist.bc\");",
        "C021",
    );
}

#[test]
fn test_module_expression_requires_string() {
    assert_compile_error("other :: module(42);", "C021");
}

#[test]
fn test_foreign_library_load_failure() {
    assert_compile_error(
        "#foreign library=\"no_such_library_xyz\" \
         f :: proc(x: address) -> s32;",
        "B062",
    );
}

#[test]
fn test_intrinsic_arity_error() {
    assert_compile_error("n :: size_of(u8, u16);", "P091");
}

#[test]
fn test_syntax_error() {
    assert_compile_error("x := ;", "P001");
}

#[test]
fn test_errors_accumulate() {
    let mut session = Session::new(SessionOptions::default());
    session.add_source(
        "test.bc",
        "x := aaa + 1;\n\
         y := bbb + 2;",
    );
    assert!(!session.compile());
    // the resolution pass completes fully so both failures surface
    let p004_count = session
        .result()
        .messages()
        .iter()
        .filter(|message| message.code() == "P004")
        .count();
    assert!(p004_count >= 2, "got: {}", session.result());
}
