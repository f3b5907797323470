//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use http::StatusCode;
use serde_json::Value;
use xml::ParserConfig;
use xml::reader::XmlEvent;
use xml::writer::EmitterConfig;
use yang3::data::DataFormat;

use crate::errors::{ErrorResponse, ErrorTag, ErrorType};
use vireo_datastore::EditOperation;

/// One decoded edit of a YANG-Patch document (RFC 8072, section 2.5).
/// `value` carries the raw serialized node, still in the request encoding.
#[derive(Debug)]
pub struct Edit {
    pub edit_id: String,
    pub operation: EditOperation,
    pub target: String,
    pub value: Option<String>,
}

#[derive(Debug)]
pub struct YangPatch {
    pub patch_id: String,
    pub edits: Vec<Edit>,
}

// ===== global functions =====

/// Decodes a YANG-Patch document from its JSON or XML form.
pub fn parse(body: &str, format: DataFormat) -> Result<YangPatch, ErrorResponse> {
    let patch = match format {
        DataFormat::JSON => parse_json(body)?,
        _ => parse_xml(body)?,
    };

    if patch.edits.is_empty() {
        return Err(invalid_value("Empty edit list in YANG patch"));
    }

    Ok(patch)
}

// ===== helper functions =====

fn parse_json(body: &str) -> Result<YangPatch, ErrorResponse> {
    let value: Value = serde_json::from_str(body)
        .map_err(|error| invalid_value(format!("Invalid JSON: {error}")))?;
    let patch = value
        .get("ietf-yang-patch:yang-patch")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            invalid_value("Expected an 'ietf-yang-patch:yang-patch' object")
        })?;

    let patch_id = patch
        .get("patch-id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let mut edits = Vec::new();
    for edit in patch
        .get("edit")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let edit_id = edit
            .get("edit-id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let operation = edit
            .get("operation")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_value("Edit without an operation"))?;
        let target = edit
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_value("Edit without a target"))?
            .to_owned();
        let value = edit.get("value").map(|value| value.to_string());

        edits.push(Edit {
            edit_id,
            operation: parse_operation(operation)?,
            target,
            value,
        });
    }

    Ok(YangPatch { patch_id, edits })
}

// Streams through the XML form, re-emitting the content of each <value>
// element verbatim so it can later be parsed against the schema.
fn parse_xml(body: &str) -> Result<YangPatch, ErrorResponse> {
    let reader = ParserConfig::new().create_reader(body.as_bytes());

    let mut patch_id = String::new();
    let mut edits: Vec<Edit> = Vec::new();

    let mut field: Option<String> = None;
    let mut text = String::new();
    let mut value_writer: Option<xml::writer::EventWriter<Vec<u8>>> = None;
    let mut value_depth = 0u32;

    for event in reader {
        let event = event.map_err(|error| {
            invalid_value(format!("Invalid XML: {error}"))
        })?;

        // Inside <value>, forward everything verbatim.
        if let Some(writer) = value_writer.as_mut() {
            match &event {
                XmlEvent::StartElement { .. } => value_depth += 1,
                XmlEvent::EndElement { name }
                    if name.local_name == "value" && value_depth == 0 =>
                {
                    let writer = value_writer.take().unwrap();
                    let value = String::from_utf8(writer.into_inner())
                        .unwrap_or_default();
                    if let Some(edit) = edits.last_mut() {
                        edit.value = Some(value);
                    }
                    continue;
                }
                XmlEvent::EndElement { .. } => value_depth -= 1,
                _ => (),
            }
            if let Some(writer_event) = event.as_writer_event() {
                let _ = value_writer.as_mut().unwrap().write(writer_event);
            }
            continue;
        }

        match event {
            XmlEvent::StartElement { name, .. } => {
                match name.local_name.as_str() {
                    "edit" => {
                        edits.push(Edit {
                            edit_id: String::new(),
                            operation: EditOperation::Merge,
                            target: String::new(),
                            value: None,
                        });
                    }
                    "value" => {
                        let writer = EmitterConfig::new()
                            .write_document_declaration(false)
                            .create_writer(Vec::new());
                        value_writer = Some(writer);
                        value_depth = 0;
                    }
                    other => {
                        field = Some(other.to_owned());
                        text.clear();
                    }
                }
            }
            XmlEvent::Characters(chars) => {
                if field.is_some() {
                    text.push_str(&chars);
                }
            }
            XmlEvent::EndElement { name } => {
                let Some(current) = field.take() else {
                    continue;
                };
                if current != name.local_name {
                    continue;
                }
                let value = text.trim().to_owned();
                match current.as_str() {
                    "patch-id" => patch_id = value,
                    "edit-id" => {
                        if let Some(edit) = edits.last_mut() {
                            edit.edit_id = value;
                        }
                    }
                    "operation" => {
                        if let Some(edit) = edits.last_mut() {
                            edit.operation = parse_operation(&value)?;
                        }
                    }
                    "target" => {
                        if let Some(edit) = edits.last_mut() {
                            edit.target = value;
                        }
                    }
                    _ => (),
                }
            }
            _ => (),
        }
    }

    Ok(YangPatch { patch_id, edits })
}

fn parse_operation(operation: &str) -> Result<EditOperation, ErrorResponse> {
    match operation {
        "create" => Ok(EditOperation::Create),
        "merge" => Ok(EditOperation::Merge),
        "replace" => Ok(EditOperation::Replace),
        "remove" => Ok(EditOperation::Remove),
        "delete" => Ok(EditOperation::Delete),
        // insert/move need ordered-by-user support
        other => Err(ErrorResponse::new(
            StatusCode::BAD_REQUEST,
            ErrorType::Application,
            ErrorTag::OperationNotSupported,
            format!("YANG patch operation '{other}' is not supported"),
        )),
    }
}

fn invalid_value(message: impl Into<String>) -> ErrorResponse {
    ErrorResponse::new(
        StatusCode::BAD_REQUEST,
        ErrorType::Application,
        ErrorTag::InvalidValue,
        message,
    )
}
