//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use http::StatusCode;
use yang3::context::Context;
use yang3::iter::NodeIterable;
use yang3::schema::{SchemaNode, SchemaNodeKind, SchemaPathFormat};

use crate::errors::{ErrorResponse, ErrorTag, ErrorType};
use crate::uri::{ApiIdentifier, PathSegment};

/// One resolved path segment, carrying everything the payload codec needs
/// to rebuild the ancestor chain around a request body.
#[derive(Clone, Debug)]
pub struct ResolvedSegment {
    pub module: String,
    pub namespace: String,
    pub name: String,
    /// `true` when the canonical path emits the module prefix here.
    pub qualified: bool,
    pub kind: SchemaNodeKind,
    /// Key name/value pairs in declared order; leaf-list positions use "."
    /// as the name.
    pub keys: Vec<(String, String)>,
}

/// The result of resolving a `ResourcePath` against the loaded schema.
#[derive(Clone, Debug)]
pub struct ResolvedPath {
    /// Canonical libyang path, list keys rendered as predicates.
    pub xpath: String,
    /// Schema path without predicates (RPC dispatch, NACM).
    pub schema_path: String,
    pub segments: Vec<ResolvedSegment>,
    pub kind: SchemaNodeKind,
    pub module: String,
}

// ===== impl ResolvedPath =====

impl ResolvedPath {
    /// The terminal segment.
    pub fn terminal(&self) -> &ResolvedSegment {
        self.segments.last().expect("resolved path has no segments")
    }

    /// The ancestor chain of the terminal node.
    pub fn ancestors(&self) -> &[ResolvedSegment] {
        &self.segments[..self.segments.len() - 1]
    }

    pub fn is_operation(&self) -> bool {
        matches!(self.kind, SchemaNodeKind::Rpc | SchemaNodeKind::Action)
    }
}

// ===== global functions =====

/// Resolves parsed URI segments against the schema, producing the canonical
/// datastore path.
pub fn resolve(
    ctx: &Context,
    segments: &[PathSegment],
) -> Result<ResolvedPath, ErrorResponse> {
    let mut current: Option<SchemaNode<'_>> = None;
    let mut resolved = Vec::with_capacity(segments.len());
    let mut xpath = String::new();

    for segment in segments {
        let snode = match &current {
            Some(parent) => find_child_schema_node(parent, &segment.ident)
                .ok_or_else(|| {
                    operation_failed(format!(
                        "Node '{}' is not a child of '{}'",
                        segment.ident,
                        parent.path(SchemaPathFormat::DATA)
                    ))
                })?,
            None => {
                let module =
                    segment.ident.module.as_deref().unwrap_or_default();
                let path = format!("/{}:{}", module, segment.ident.name);
                ctx.find_path(&path).map_err(|error| {
                    operation_failed(error.to_string())
                })?
            }
        };

        // Emit the module prefix at the root and on module boundaries.
        let qualified = match snode.parent() {
            Some(parent) => {
                parent.module().name() != snode.module().name()
            }
            None => true,
        };
        xpath.push('/');
        if qualified {
            xpath.push_str(snode.module().name());
            xpath.push(':');
        }
        xpath.push_str(snode.name());

        let mut keys = Vec::new();
        match snode.kind() {
            SchemaNodeKind::List => {
                let list_keys = snode
                    .list_keys()
                    .map(|key| key.name().to_owned())
                    .collect::<Vec<_>>();
                if segment.keys.len() == list_keys.len() {
                    for (name, value) in
                        list_keys.iter().zip(segment.keys.iter())
                    {
                        xpath.push_str(&format!(
                            "[{}={}]",
                            name,
                            escape_list_key(value)?
                        ));
                        keys.push((name.clone(), value.clone()));
                    }
                } else if !segment.keys.is_empty() {
                    return Err(operation_failed(format!(
                        "List '{}' requires {} keys",
                        snode.path(SchemaPathFormat::DATA),
                        list_keys.len(),
                    )));
                }
            }
            SchemaNodeKind::LeafList => {
                if segment.keys.len() == 1 {
                    xpath.push_str(&format!(
                        "[.={}]",
                        escape_list_key(&segment.keys[0])?
                    ));
                    keys.push((".".to_owned(), segment.keys[0].clone()));
                } else if !segment.keys.is_empty() {
                    return Err(operation_failed(format!(
                        "Leaf-list '{}' accepts 0 or 1 keys",
                        snode.path(SchemaPathFormat::DATA),
                    )));
                }
            }
            _ => {
                if !segment.keys.is_empty() {
                    return Err(operation_failed(format!(
                        "Node '{}' is neither list nor leaf-list \
                         but keys were specified",
                        snode.path(SchemaPathFormat::DATA),
                    )));
                }
            }
        }

        resolved.push(ResolvedSegment {
            module: snode.module().name().to_owned(),
            namespace: snode.module().namespace().to_owned(),
            name: snode.name().to_owned(),
            qualified,
            kind: snode.kind(),
            keys,
        });
        current = Some(snode);
    }

    let terminal = current
        .ok_or_else(|| operation_failed("Empty resource path".to_owned()))?;

    Ok(ResolvedPath {
        xpath,
        schema_path: terminal.path(SchemaPathFormat::DATA),
        kind: terminal.kind(),
        module: terminal.module().name().to_owned(),
        segments: resolved,
    })
}

/// Escapes a list key for use inside an XPath predicate by wrapping it in
/// the kind of quotes the value doesn't contain. Values mixing both kinds
/// cannot be escaped in XPath 1.0.
pub fn escape_list_key(value: &str) -> Result<String, ErrorResponse> {
    let single_quotes = value.contains('\'');
    let double_quotes = value.contains('"');

    if single_quotes && double_quotes {
        Err(ErrorResponse::new(
            StatusCode::BAD_REQUEST,
            ErrorType::Application,
            ErrorTag::InvalidValue,
            "Encountered mixed single and double quotes in XPath. \
             Can't properly escape.",
        ))
    } else if single_quotes {
        Ok(format!("\"{}\"", value))
    } else {
        Ok(format!("'{}'", value))
    }
}

// ===== helper functions =====

// Searches the instantiable children of a schema node, descending through
// choice/case nodes, plus any actions and notifications.
fn find_child_schema_node<'a>(
    parent: &SchemaNode<'a>,
    ident: &ApiIdentifier,
) -> Option<SchemaNode<'a>> {
    fn matches(snode: &SchemaNode<'_>, ident: &ApiIdentifier) -> bool {
        snode.name() == ident.name
            && ident
                .module
                .as_deref()
                .map(|module| snode.module().name() == module)
                .unwrap_or(true)
    }

    fn search<'a>(
        children: impl Iterator<Item = SchemaNode<'a>>,
        ident: &ApiIdentifier,
    ) -> Option<SchemaNode<'a>> {
        for child in children {
            match child.kind() {
                SchemaNodeKind::Choice | SchemaNodeKind::Case => {
                    if let Some(found) = search(child.children(), ident) {
                        return Some(found);
                    }
                }
                _ => {
                    if matches(&child, ident) {
                        return Some(child);
                    }
                }
            }
        }
        None
    }

    search(parent.children(), ident)
        .or_else(|| parent.actions().find(|action| matches(action, ident)))
        .or_else(|| {
            parent
                .notifications()
                .find(|notification| matches(notification, ident))
        })
}

fn operation_failed(message: String) -> ErrorResponse {
    ErrorResponse::new(
        StatusCode::BAD_REQUEST,
        ErrorType::Application,
        ErrorTag::OperationFailed,
        message,
    )
}
