//! # Message Views
//!
//! Converts `prost_reflect` message descriptors into a renderable tree a
//! frontend can turn into an input form without touching descriptors itself.
//!
//! The conversion is recursive and guards against self-referential schemas:
//! a message reappearing on its own descent path is a [`ViewError`], while the
//! same message referenced from two sibling fields is fine.
use prost_reflect::{FieldDescriptor, Kind, MessageDescriptor, OneofDescriptor};
use serde::Serialize;
use std::collections::HashSet;

const STRUCT_FULL_NAME: &str = "google.protobuf.Struct";

#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("message '{message}' references itself and cannot be rendered as a form")]
    CycleDetected { message: String },
}

/// Renderable form of a message type.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub name: String,
    pub full_name: String,
    pub fields: Vec<FieldView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldView {
    pub name: String,
    pub full_name: String,
    pub repeated: bool,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// A primitive field, rendered as a single input of `proto_type`.
    Scalar { proto_type: String },
    /// An enum field with its possible value names.
    Enum { values: Vec<String> },
    /// A nested message rendered as a sub-form.
    Message { message: MessageView },
    /// A map field with views for the entry key and value.
    Map {
        key: Box<FieldView>,
        value: Box<FieldView>,
    },
    /// A oneof group; exactly one of the alternatives may be set.
    Oneof { alternatives: Vec<FieldView> },
}

/// Builds the renderable view of `desc`.
pub fn message_view(desc: &MessageDescriptor) -> Result<MessageView, ViewError> {
    build_message(desc, &HashSet::new())
}

fn build_message(
    desc: &MessageDescriptor,
    visited: &HashSet<String>,
) -> Result<MessageView, ViewError> {
    // Struct is arbitrary JSON; a recursive form makes no sense for it, so it
    // collapses into a single free-text field.
    if desc.full_name() == STRUCT_FULL_NAME {
        return Ok(struct_view(desc));
    }

    if visited.contains(desc.full_name()) {
        return Err(ViewError::CycleDetected {
            message: desc.full_name().to_string(),
        });
    }

    // The visited set tracks the current descent path only. Cloning it per
    // level keeps sibling fields free to reference the same message type.
    let mut visited = visited.clone();
    visited.insert(desc.full_name().to_string());

    let mut fields = Vec::new();
    let mut rendered_oneofs = HashSet::new();

    for field in desc.fields() {
        if let Some(oneof) = field.containing_oneof()
            && !is_synthetic_oneof(&oneof)
        {
            // The whole group renders once, at the position of its first
            // member; later members are already represented.
            if !rendered_oneofs.insert(oneof.full_name().to_string()) {
                continue;
            }
            let alternatives = oneof
                .fields()
                .map(|f| build_field(&f, &visited))
                .collect::<Result<Vec<_>, _>>()?;
            fields.push(FieldView {
                name: oneof.name().to_string(),
                full_name: oneof.full_name().to_string(),
                repeated: false,
                kind: FieldKind::Oneof { alternatives },
            });
            continue;
        }
        fields.push(build_field(&field, &visited)?);
    }

    Ok(MessageView {
        name: desc.name().to_string(),
        full_name: desc.full_name().to_string(),
        fields,
    })
}

fn build_field(
    field: &FieldDescriptor,
    visited: &HashSet<String>,
) -> Result<FieldView, ViewError> {
    let kind = if field.is_map()
        && let Kind::Message(entry) = field.kind()
    {
        let key = entry.map_entry_key_field();
        let value = entry.map_entry_value_field();
        FieldKind::Map {
            key: Box::new(build_field(&key, visited)?),
            value: Box::new(build_field(&value, visited)?),
        }
    } else {
        match field.kind() {
            Kind::Message(message) => FieldKind::Message {
                message: build_message(&message, visited)?,
            },
            Kind::Enum(desc) => FieldKind::Enum {
                values: desc.values().map(|v| v.name().to_string()).collect(),
            },
            scalar => FieldKind::Scalar {
                proto_type: scalar_name(&scalar).to_string(),
            },
        }
    };

    Ok(FieldView {
        name: field.name().to_string(),
        full_name: field.full_name().to_string(),
        // Map fields are lists of entries on the wire but render as a single
        // key/value widget.
        repeated: field.is_list() && !field.is_map(),
        kind,
    })
}

fn struct_view(desc: &MessageDescriptor) -> MessageView {
    MessageView {
        name: desc.name().to_string(),
        full_name: desc.full_name().to_string(),
        fields: vec![FieldView {
            name: "value".to_string(),
            full_name: format!("{}.value", desc.full_name()),
            repeated: false,
            kind: FieldKind::Scalar {
                proto_type: "string".to_string(),
            },
        }],
    }
}

// proto3 `optional` fields arrive wrapped in a single-field synthetic oneof
// which should not show up as a choice in the form.
fn is_synthetic_oneof(oneof: &OneofDescriptor) -> bool {
    let mut fields = oneof.fields();
    match (fields.next(), fields.next()) {
        (Some(field), None) => field.field_descriptor_proto().proto3_optional(),
        _ => false,
    }
}

fn scalar_name(kind: &Kind) -> &'static str {
    match kind {
        Kind::Double => "double",
        Kind::Float => "float",
        Kind::Int32 => "int32",
        Kind::Int64 => "int64",
        Kind::Uint32 => "uint32",
        Kind::Uint64 => "uint64",
        Kind::Sint32 => "sint32",
        Kind::Sint64 => "sint64",
        Kind::Fixed32 => "fixed32",
        Kind::Fixed64 => "fixed64",
        Kind::Sfixed32 => "sfixed32",
        Kind::Sfixed64 => "sfixed64",
        Kind::Bool => "bool",
        Kind::String => "string",
        Kind::Bytes => "bytes",
        // Handled by the callers before reaching here.
        Kind::Message(_) => "message",
        Kind::Enum(_) => "enum",
    }
}
