//! Tests for the `#foreign` directive and the FFI bridge. These load the
//! platform C runtime, so they exercise the real dynamic loader.

use basecode::compiler::{Session, SessionOptions, TypeVariant};
use basecode::vm::instruction::OpSize;
use basecode::vm::FfiType;

#[test]
fn test_foreign_import_registers_signature() {
    let mut session = Session::new(SessionOptions::default());
    session.add_source(
        "test.bc",
        "#foreign library=\"libc\" alias=\"puts\" \
         puts :: proc(s: address) -> s32;",
    );
    assert!(
        session.compile(),
        "compile failed:\n{}",
        session.result(),
    );

    let functions = session.terp().foreign_functions();
    assert_eq!(functions.len(), 1);
    let signature = &functions[0];
    assert_eq!(signature.symbol, "puts");
    assert_ne!(signature.address, 0);
    assert_eq!(signature.arguments.len(), 1);
    assert_eq!(signature.arguments[0].value_type, FfiType::Pointer);
    assert_eq!(signature.return_value.value_type, FfiType::Int);

    // the procedure type is marked foreign
    let identifier = session.find_identifier_element("puts").unwrap();
    let initializer = session
        .elements()
        .identifier(identifier)
        .unwrap()
        .initializer
        .unwrap();
    let expression = match &session
        .elements()
        .find(initializer)
        .unwrap()
        .kind
    {
        basecode::compiler::ElementKind::Initializer(data) => {
            data.expression
        }
        other => panic!("expected initializer, got {:?}", other),
    };
    let type_data =
        session.elements().type_data(expression).expect("proc type");
    match &type_data.variant {
        TypeVariant::Procedure {
            is_foreign,
            foreign_index,
            ..
        } => {
            assert!(*is_foreign);
            assert_eq!(*foreign_index, Some(0));
        }
        other => panic!("expected procedure type, got {:?}", other),
    }
}

#[test]
fn test_foreign_call_round_trip() {
    let mut session = Session::new(SessionOptions::default());
    session.add_source(
        "test.bc",
        "#foreign library=\"libc\" alias=\"abs\" \
         f_abs :: proc(v: s32) -> s32;\n\
         r: s32 := 0;\n\
         r := f_abs(-5);",
    );
    assert!(
        session.compile(),
        "compile failed:\n{}",
        session.result(),
    );
    assert!(session.run(), "run failed:\n{}", session.result());

    let address = session.assembler().symbol_address("r").unwrap();
    assert_eq!(
        session.terp().read_sized(OpSize::Dword, address) as i32,
        5,
    );
}
