//! Tests for the elaboration passes: the element graph a compile leaves
//! behind, symbol resolution, type interning, and constant folding.

use basecode::compiler::{
    ElementKind, ElementTag, Session, SessionOptions, TypeVariant,
};

fn compile(source: &str) -> Session {
    let mut session = Session::new(SessionOptions::default());
    session.add_source("test.bc", source);
    assert!(
        session.compile(),
        "compile failed:\n{}",
        session.result(),
    );
    session
}

#[test]
fn test_identifier_binds_declared_type() {
    let session = compile("x: u32 := 10;");
    let identifier = session.find_identifier_element("x").unwrap();
    assert_eq!(
        session.identifier_type_name(identifier).as_deref(),
        Some("u32"),
    );
    let data = session.elements().identifier(identifier).unwrap();
    assert!(!data.inferred_type);
    assert!(data.initializer.is_some());
}

#[test]
fn test_struct_with_inferred_field_types() {
    let session = compile("Point :: struct { x := 0; y := 0; };");

    let identifier = session.find_identifier_element("Point").unwrap();
    let type_name =
        session.identifier_type_name(identifier).unwrap();
    assert!(
        type_name.starts_with("__struct_"),
        "structural name, got {}",
        type_name,
    );

    let type_id = session
        .elements()
        .identifier(identifier)
        .unwrap()
        .type_id
        .unwrap();
    let type_data = session.elements().type_data(type_id).unwrap();
    let fields = match &type_data.variant {
        TypeVariant::Composite { fields, .. } => fields.clone(),
        other => panic!("expected a composite type, got {:?}", other),
    };
    assert_eq!(fields.len(), 2);

    for field in fields {
        let field_identifier =
            match &session.elements().find(field).unwrap().kind {
                ElementKind::Field(data) => data.identifier,
                other => panic!("expected a field, got {:?}", other),
            };
        let data =
            session.elements().identifier(field_identifier).unwrap();
        assert!(data.inferred_type);
        assert_eq!(
            session
                .identifier_type_name(field_identifier)
                .as_deref(),
            Some("u32"),
        );
    }

    // two fields laid out at natural alignment
    assert_eq!(type_data.size_in_bytes, 8);
}

#[test]
fn test_enum_fields_default_to_u32() {
    let session = compile("Color :: enum { red; green; blue; };");
    let identifier = session.find_identifier_element("red").unwrap();
    assert_eq!(
        session.identifier_type_name(identifier).as_deref(),
        Some("u32"),
    );
}

#[test]
fn test_size_of_substitution_removes_the_intrinsic() {
    let session = compile("N :: size_of(u64);");

    // nothing intrinsic survives in the registry
    assert!(session
        .elements()
        .find_by_tag(ElementTag::Intrinsic)
        .is_empty());

    // the initializer expression is now a literal 8
    let identifier = session.find_identifier_element("N").unwrap();
    let initializer = session
        .elements()
        .identifier(identifier)
        .unwrap()
        .initializer
        .unwrap();
    assert_eq!(session.elements().as_integer(initializer), Some(8));
}

#[test]
fn test_qualified_namespace_reference_resolves() {
    let session = compile(
        "math :: namespace { pi :: 3.14159; };\n\
         r := math::pi * 2.0;",
    );

    // r's type was inferred from the float expression
    let r = session.find_identifier_element("r").unwrap();
    assert_eq!(session.identifier_type_name(r).as_deref(), Some("f64"));
    assert!(session.elements().identifier(r).unwrap().inferred_type);

    // the reference element resolved to the identifier declared inside
    // the namespace block
    let pi = session.find_identifier_element("pi").unwrap();
    let reference = session
        .elements()
        .find_by_tag(ElementTag::IdentifierReference)
        .into_iter()
        .find(|id| {
            match &session.elements().find(*id).unwrap().kind {
                ElementKind::IdentifierReference(data) => {
                    data.symbol.fully_qualified == "math::pi"
                }
                _ => false,
            }
        })
        .expect("reference to math::pi");
    match &session.elements().find(reference).unwrap().kind {
        ElementKind::IdentifierReference(data) => {
            assert_eq!(data.identifier, Some(pi));
        }
        _ => unreachable!(),
    }
}

#[test]
fn test_array_types_are_interned() {
    let session = compile(
        "a: u32[4];\n\
         b: u32[4];\n\
         c: u32[8];",
    );
    let type_of = |name: &str| {
        let identifier = session.find_identifier_element(name).unwrap();
        session
            .elements()
            .identifier(identifier)
            .unwrap()
            .type_id
            .unwrap()
    };
    // same entry type and size share one element; a different size does
    // not
    assert_eq!(type_of("a"), type_of("b"));
    assert_ne!(type_of("a"), type_of("c"));
    assert_eq!(
        session
            .elements()
            .type_data(type_of("a"))
            .unwrap()
            .name,
        "__array_u32_4__",
    );
}

#[test]
fn test_pointer_types_are_interned() {
    let session = compile(
        "p: *u8;\n\
         q: *u8;",
    );
    let type_of = |name: &str| {
        let identifier = session.find_identifier_element(name).unwrap();
        session
            .elements()
            .identifier(identifier)
            .unwrap()
            .type_id
            .unwrap()
    };
    assert_eq!(type_of("p"), type_of("q"));
    assert_eq!(
        session
            .elements()
            .type_data(type_of("p"))
            .unwrap()
            .name,
        "__ptr_u8__",
    );
}

#[test]
fn test_forward_declared_type_resolves() {
    let session = compile(
        "p: point_t;\n\
         point_t :: struct { x := 0; y := 0; };",
    );
    let identifier = session.find_identifier_element("p").unwrap();
    let type_name = session.identifier_type_name(identifier).unwrap();
    assert!(type_name.starts_with("__struct_"));
    // no unknown types survive resolution
    assert!(session
        .elements()
        .find_by_tag(ElementTag::UnknownType)
        .is_empty());
}

#[test]
fn test_registry_ownership_is_a_forest() {
    let session = compile(
        "x: u32 := 1;\n\
         x := x + 2;",
    );
    // every element with a parent appears among that parent's owned
    // children
    for tag in [
        ElementTag::BinaryOperator,
        ElementTag::IntegerLiteral,
        ElementTag::Initializer,
    ] {
        for id in session.elements().find_by_tag(tag) {
            let element = session.elements().find(id).unwrap();
            if let Some(parent) = element.parent_element {
                let parent_element =
                    session.elements().find(parent).unwrap();
                let owned = parent_element.owned_elements();
                assert!(
                    owned.contains(&id),
                    "{:?} not owned by its parent {:?}",
                    id,
                    parent,
                );
            }
        }
    }
}

#[test]
fn test_interned_string_literals_share_one_entry() {
    let session = compile(
        "a :: \"shared\";\n\
         b :: \"shared\";",
    );
    let strings =
        session.elements().find_by_tag(ElementTag::StringLiteral);
    assert_eq!(strings.len(), 2);
    // both literals share one interned constant symbol
    let labels: Vec<_> = session
        .assembler()
        .segments()
        .iter()
        .flat_map(|segment| segment.symbols())
        .filter(|symbol| symbol.name.starts_with("_str_"))
        .collect();
    assert_eq!(labels.len(), 1);
}

#[test]
fn test_import_is_attached_to_scope() {
    let session = compile(
        "math :: namespace { pi :: 3.14159; };\n\
         import math;",
    );
    let imports = session.elements().find_by_tag(ElementTag::Import);
    assert_eq!(imports.len(), 1);
}
