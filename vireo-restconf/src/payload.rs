//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use http::StatusCode;
use serde_json::{Map, Value};
use xml::ParserConfig;
use xml::reader::XmlEvent;
use yang3::context::Context;
use yang3::data::{
    Data, DataFormat, DataOperation, DataParserFlags, DataTree,
    DataValidationFlags,
};

use crate::errors::{ErrorResponse, ErrorTag, ErrorType, escape_xml};
use crate::resolver::ResolvedSegment;

const NETCONF_BASE_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

/// The top-level node of a request body.
#[derive(Debug)]
pub struct TopMember {
    pub module: Option<String>,
    pub name: String,
    /// Number of top-level members found (must usually be exactly one).
    pub count: usize,
}

// ===== global functions =====

/// Extracts the identity of the top-level payload node without parsing the
/// body against the schema yet.
pub fn payload_top_member(
    ctx: &Context,
    body: &str,
    format: DataFormat,
) -> Result<TopMember, ErrorResponse> {
    reject_operation_metadata(body, format)?;

    match format {
        DataFormat::JSON => {
            let value: Value =
                serde_json::from_str(body).map_err(|error| {
                    invalid_value(format!("Invalid JSON: {error}"))
                })?;
            let Value::Object(members) = value else {
                return Err(invalid_value(
                    "Expected a JSON object at the top level",
                ));
            };
            if members.is_empty() {
                return Err(empty_data_tree());
            }
            let name = members.keys().next().unwrap().clone();
            let (module, name) = match name.split_once(':') {
                Some((module, name)) => {
                    (Some(module.to_owned()), name.to_owned())
                }
                None => (None, name),
            };
            Ok(TopMember {
                module,
                name,
                count: members.len(),
            })
        }
        _ => {
            let (name, namespace) = xml_top_element(body)?;
            let module = namespace
                .as_deref()
                .and_then(|ns| module_for_namespace(ctx, ns));
            Ok(TopMember {
                module,
                name,
                count: 1,
            })
        }
    }
}

/// Rebuilds the full-tree document around a request body by wrapping it in
/// its resolved ancestor chain (list keys from the URI), then parses and
/// validates it.
pub fn parse_payload(
    ctx: &'static Context,
    ancestors: &[ResolvedSegment],
    body: &str,
    format: DataFormat,
) -> Result<DataTree<'static>, ErrorResponse> {
    let document = match format {
        DataFormat::JSON => {
            let value: Value =
                serde_json::from_str(body).map_err(|error| {
                    invalid_value(format!("Invalid JSON: {error}"))
                })?;
            let Value::Object(members) = value else {
                return Err(invalid_value(
                    "Expected a JSON object at the top level",
                ));
            };
            if members.is_empty() {
                return Err(empty_data_tree());
            }
            wrap_json(ancestors, members).to_string()
        }
        _ => {
            if body.trim().is_empty() {
                return Err(empty_data_tree());
            }
            wrap_xml(ancestors, body)
        }
    };

    DataTree::parse_string(
        ctx,
        &document,
        format,
        DataParserFlags::empty(),
        DataValidationFlags::NO_STATE | DataValidationFlags::PRESENT,
    )
    .map_err(|error| invalid_value(error.to_string()))
}

/// Parses the body of an RPC or action invocation into an operation tree.
/// The RESTCONF `input` wrapper is replaced by the operation node itself,
/// nested in its ancestor chain for actions.
pub fn parse_rpc_input(
    ctx: &'static Context,
    segments: &[ResolvedSegment],
    body: &str,
    format: DataFormat,
) -> Result<DataTree<'static>, ErrorResponse> {
    let (terminal, ancestors) = segments.split_last().unwrap();

    let document = match format {
        DataFormat::JSON => {
            let input_members = if body.trim().is_empty() {
                Map::new()
            } else {
                reject_operation_metadata(body, format)?;
                let value: Value =
                    serde_json::from_str(body).map_err(|error| {
                        invalid_value(format!("Invalid JSON: {error}"))
                    })?;
                let Value::Object(members) = value else {
                    return Err(invalid_value(
                        "Expected a JSON object at the top level",
                    ));
                };
                match members.len() {
                    0 => Map::new(),
                    1 => {
                        let (name, value) =
                            members.into_iter().next().unwrap();
                        check_input_member(&name, &terminal.module)?;
                        match value {
                            Value::Object(members) => members,
                            Value::Null => Map::new(),
                            _ => {
                                return Err(invalid_value(
                                    "RPC input must be an object",
                                ));
                            }
                        }
                    }
                    _ => {
                        return Err(invalid_value(
                            "Expected a single 'input' node",
                        ));
                    }
                }
            };

            let mut rpc = Map::new();
            rpc.insert(
                format!("{}:{}", terminal.module, terminal.name),
                Value::Object(input_members),
            );
            wrap_json(ancestors, rpc).to_string()
        }
        _ => {
            let inner = if body.trim().is_empty() {
                String::new()
            } else {
                reject_operation_metadata(body, format)?;
                let (name, _namespace) = xml_top_element(body)?;
                if name != "input" {
                    return Err(invalid_value(
                        "Expected a single 'input' node",
                    ));
                }
                xml_inner(body, "input").unwrap_or_default()
            };
            let rpc = format!(
                "<{} xmlns=\"{}\">{}</{}>",
                terminal.name, terminal.namespace, inner, terminal.name
            );
            wrap_xml(ancestors, &rpc)
        }
    };

    DataTree::parse_op_string(
        ctx,
        &document,
        format,
        DataOperation::RpcYang,
    )
    .map_err(|error| invalid_value(error.to_string()))
}

/// Serializes an RPC/action output tree as the RESTCONF `output` document.
/// Returns `None` when the operation produced no output.
pub fn rpc_output_body(
    terminal: &ResolvedSegment,
    output: &DataTree<'static>,
    format: DataFormat,
) -> Result<Option<String>, ErrorResponse> {
    let printed = output
        .print_string(
            format,
            yang3::data::DataPrinterFlags::WITH_SIBLINGS,
        )
        .map_err(|error| {
            ErrorResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorType::Application,
                ErrorTag::OperationFailed,
                error.to_string(),
            )
        })?;
    if printed.trim().is_empty() {
        return Ok(None);
    }

    match format {
        DataFormat::JSON => {
            let value: Value = serde_json::from_str(&printed)
                .unwrap_or(Value::Null);
            let inner = value
                .as_object()
                .and_then(|members| members.values().next())
                .cloned()
                .unwrap_or(Value::Null);
            match inner {
                Value::Object(members) if !members.is_empty() => {
                    let mut document = Map::new();
                    document.insert(
                        format!("{}:output", terminal.module),
                        Value::Object(members),
                    );
                    Ok(Some(Value::Object(document).to_string()))
                }
                _ => Ok(None),
            }
        }
        _ => {
            match xml_inner(&printed, &terminal.name) {
                Some(inner) if !inner.trim().is_empty() => Ok(Some(format!(
                    "<output xmlns=\"{}\">{}</output>",
                    terminal.namespace, inner
                ))),
                _ => Ok(None),
            }
        }
    }
}

// ===== helper functions =====

// Builds the JSON ancestor envelope: list segments become single-entry
// arrays carrying their URI keys, everything else nests plain objects.
fn wrap_json(ancestors: &[ResolvedSegment], inner: Map<String, Value>) -> Value {
    let mut inner = inner;
    for segment in ancestors.iter().rev() {
        let mut object = Map::new();
        for (name, value) in &segment.keys {
            if name != "." {
                object.insert(name.clone(), Value::String(value.clone()));
            }
        }
        object.extend(inner);

        let value = if segment.kind == yang3::schema::SchemaNodeKind::List {
            Value::Array(vec![Value::Object(object)])
        } else {
            Value::Object(object)
        };

        inner = Map::new();
        inner.insert(
            format!("{}:{}", segment.module, segment.name),
            value,
        );
    }
    Value::Object(inner)
}

// Builds the XML ancestor envelope around a raw body.
fn wrap_xml(ancestors: &[ResolvedSegment], body: &str) -> String {
    let mut document = String::new();
    for segment in ancestors {
        document.push_str(&format!(
            "<{} xmlns=\"{}\">",
            segment.name, segment.namespace
        ));
        for (name, value) in &segment.keys {
            if name != "." {
                document.push_str(&format!(
                    "<{}>{}</{}>",
                    name,
                    escape_xml(value),
                    name
                ));
            }
        }
    }
    document.push_str(body);
    for segment in ancestors.iter().rev() {
        document.push_str(&format!("</{}>", segment.name));
    }
    document
}

// Returns the name and namespace of the first element of an XML document.
fn xml_top_element(
    body: &str,
) -> Result<(String, Option<String>), ErrorResponse> {
    let reader = ParserConfig::new().create_reader(body.as_bytes());
    for event in reader {
        match event {
            Ok(XmlEvent::StartElement { name, .. }) => {
                return Ok((name.local_name, name.namespace));
            }
            Ok(XmlEvent::EndDocument) => break,
            Ok(_) => continue,
            Err(error) => {
                return Err(invalid_value(format!("Invalid XML: {error}")));
            }
        }
    }
    Err(empty_data_tree())
}

// Extracts the raw content between the opening and closing tags of the
// top-level `element`.
fn xml_inner(body: &str, element: &str) -> Option<String> {
    let open_end = body.find('>')?;
    if body[..open_end].ends_with('/') {
        return Some(String::new());
    }
    let close = body.rfind(&format!("</{}", element))?;
    if close <= open_end {
        return None;
    }
    Some(body[open_end + 1..close].to_owned())
}

// The `ietf-netconf:operation` attribute picks edit operations per node,
// which RESTCONF payloads must not do.
fn reject_operation_metadata(
    body: &str,
    format: DataFormat,
) -> Result<(), ErrorResponse> {
    let found = match format {
        DataFormat::JSON => {
            fn scan(value: &Value) -> bool {
                match value {
                    Value::Object(members) => {
                        members.iter().any(|(name, value)| {
                            name.ends_with("ietf-netconf:operation")
                                || scan(value)
                        })
                    }
                    Value::Array(items) => items.iter().any(scan),
                    _ => false,
                }
            }
            serde_json::from_str::<Value>(body)
                .map(|value| scan(&value))
                .unwrap_or(false)
        }
        _ => {
            let reader = ParserConfig::new().create_reader(body.as_bytes());
            let mut found = false;
            for event in reader {
                if let Ok(XmlEvent::StartElement { attributes, .. }) = event
                {
                    if attributes.iter().any(|attribute| {
                        attribute.name.local_name == "operation"
                            && attribute.name.namespace.as_deref()
                                == Some(NETCONF_BASE_NS)
                    }) {
                        found = true;
                        break;
                    }
                } else if event.is_err() {
                    break;
                }
            }
            found
        }
    };

    if found {
        Err(invalid_value(
            "The 'ietf-netconf:operation' metadata is not allowed in \
             RESTCONF payloads",
        ))
    } else {
        Ok(())
    }
}

fn check_input_member(
    name: &str,
    module: &str,
) -> Result<(), ErrorResponse> {
    let valid = match name.split_once(':') {
        Some((prefix, name)) => prefix == module && name == "input",
        None => name == "input",
    };
    if valid {
        Ok(())
    } else {
        Err(invalid_value("Expected a single 'input' node"))
    }
}

fn module_for_namespace(ctx: &Context, namespace: &str) -> Option<String> {
    ctx.modules(true)
        .find(|module| module.namespace() == namespace)
        .map(|module| module.name().to_owned())
}

fn invalid_value(message: impl Into<String>) -> ErrorResponse {
    ErrorResponse::new(
        StatusCode::BAD_REQUEST,
        ErrorType::Application,
        ErrorTag::InvalidValue,
        message,
    )
}

fn empty_data_tree() -> ErrorResponse {
    ErrorResponse::new(
        StatusCode::BAD_REQUEST,
        ErrorType::Protocol,
        ErrorTag::MalformedMessage,
        "Empty data tree received",
    )
}
