use echo_service::FILE_DESCRIPTOR_SET;
use prost_reflect::{DeserializeOptions, DynamicMessage, Value};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
};
use sonda_core::schema::DescriptorRegistry;
use sonda_core::view::{FieldKind, FieldView, ViewError, message_view};

fn registry() -> DescriptorRegistry {
    DescriptorRegistry::decode(FILE_DESCRIPTOR_SET).unwrap()
}

fn field<'a>(fields: &'a [FieldView], name: &str) -> &'a FieldView {
    fields
        .iter()
        .find(|f| f.name == name)
        .unwrap_or_else(|| panic!("no field named '{name}'"))
}

#[test]
fn payload_view_covers_every_field_shape() {
    let registry = registry();
    let desc = registry.pool().get_message_by_name("echo.Payload").unwrap();
    let view = message_view(&desc).unwrap();

    assert_eq!(view.full_name, "echo.Payload");

    match &field(&view.fields, "note").kind {
        FieldKind::Scalar { proto_type } => assert_eq!(proto_type, "string"),
        other => panic!("unexpected kind for note: {other:?}"),
    }
    match &field(&view.fields, "count").kind {
        FieldKind::Scalar { proto_type } => assert_eq!(proto_type, "int32"),
        other => panic!("unexpected kind for count: {other:?}"),
    }

    match &field(&view.fields, "mood").kind {
        FieldKind::Enum { values } => {
            assert!(values.contains(&"HAPPY".to_string()));
            assert!(values.contains(&"GRUMPY".to_string()));
        }
        other => panic!("unexpected kind for mood: {other:?}"),
    }

    let tags = field(&view.fields, "tags");
    assert!(tags.repeated);
    assert!(matches!(&tags.kind, FieldKind::Scalar { proto_type } if proto_type == "string"));

    let counters = field(&view.fields, "counters");
    assert!(!counters.repeated, "maps render as a single widget");
    match &counters.kind {
        FieldKind::Map { key, value } => {
            assert!(matches!(&key.kind, FieldKind::Scalar { proto_type } if proto_type == "string"));
            assert!(matches!(&value.kind, FieldKind::Scalar { proto_type } if proto_type == "int64"));
        }
        other => panic!("unexpected kind for counters: {other:?}"),
    }

    match &field(&view.fields, "children").kind {
        FieldKind::Map { value, .. } => match &value.kind {
            FieldKind::Message { message } => assert_eq!(message.full_name, "echo.Inner"),
            other => panic!("unexpected map value kind: {other:?}"),
        },
        other => panic!("unexpected kind for children: {other:?}"),
    }

    match &field(&view.fields, "inner").kind {
        FieldKind::Message { message } => assert_eq!(message.full_name, "echo.Inner"),
        other => panic!("unexpected kind for inner: {other:?}"),
    }
}

#[test]
fn oneof_members_collapse_into_a_single_group() {
    let registry = registry();
    let desc = registry.pool().get_message_by_name("echo.Payload").unwrap();
    let view = message_view(&desc).unwrap();

    assert!(!view.fields.iter().any(|f| f.name == "text"));
    assert!(!view.fields.iter().any(|f| f.name == "boxed"));

    // The group sits where its first member is declared, not at the end.
    let order: Vec<_> = view.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(
        order,
        ["note", "count", "mood", "tags", "counters", "children", "inner", "choice", "extra"]
    );

    match &field(&view.fields, "choice").kind {
        FieldKind::Oneof { alternatives } => {
            let names: Vec<_> = alternatives.iter().map(|a| a.name.as_str()).collect();
            assert_eq!(names, ["text", "boxed"]);
            assert!(matches!(
                &alternatives[1].kind,
                FieldKind::Message { message } if message.full_name == "echo.Inner"
            ));
        }
        other => panic!("unexpected kind for choice: {other:?}"),
    }
}

#[test]
fn struct_fields_collapse_into_free_text() {
    let registry = registry();
    let desc = registry.pool().get_message_by_name("echo.Payload").unwrap();
    let view = message_view(&desc).unwrap();

    match &field(&view.fields, "extra").kind {
        FieldKind::Message { message } => {
            assert_eq!(message.full_name, "google.protobuf.Struct");
            assert_eq!(message.fields.len(), 1);
            assert_eq!(message.fields[0].name, "value");
        }
        other => panic!("unexpected kind for extra: {other:?}"),
    }
}

#[test]
fn self_referential_messages_are_rejected() {
    let file = FileDescriptorProto {
        name: Some("cycle.proto".to_string()),
        package: Some("cycle".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![DescriptorProto {
            name: Some("Node".to_string()),
            field: vec![FieldDescriptorProto {
                name: Some("next".to_string()),
                json_name: Some("next".to_string()),
                number: Some(1),
                label: Some(Label::Optional as i32),
                r#type: Some(Type::Message as i32),
                type_name: Some(".cycle.Node".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    };
    let registry =
        DescriptorRegistry::from_file_descriptor_set(FileDescriptorSet { file: vec![file] })
            .unwrap();
    let desc = registry.pool().get_message_by_name("cycle.Node").unwrap();

    let err = message_view(&desc).unwrap_err();
    assert!(matches!(
        err,
        ViewError::CycleDetected { message } if message == "cycle.Node"
    ));
}

#[test]
fn sibling_references_to_the_same_message_are_fine() {
    // Payload references echo.Inner from three different fields; only a
    // reference back onto the current descent path is a cycle.
    let registry = registry();
    let desc = registry.pool().get_message_by_name("echo.Payload").unwrap();
    assert!(message_view(&desc).is_ok());
}

#[test]
fn form_json_deserializes_into_the_described_message() {
    let registry = registry();
    let desc = registry.pool().get_message_by_name("echo.Payload").unwrap();

    let json = serde_json::json!({
        "note": "n",
        "count": 3,
        "mood": "HAPPY",
        "tags": ["a", "b"],
        "counters": { "hits": "7" },
        "inner": { "id": "i1" },
        "text": "chosen",
    });
    let message = DynamicMessage::deserialize_with_options(
        desc,
        json,
        &DeserializeOptions::new().deny_unknown_fields(false),
    )
    .unwrap();

    assert_eq!(
        message.get_field_by_name("note").unwrap().as_ref(),
        &Value::String("n".to_string())
    );
    assert_eq!(
        message.get_field_by_name("count").unwrap().as_ref(),
        &Value::I32(3)
    );
}
