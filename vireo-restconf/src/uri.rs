//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use http::StatusCode;
use vireo_datastore::{ContentFilter, Datastore, WithDefaults};

use crate::errors::{ErrorResponse, ErrorTag, ErrorType};

// Reserved characters according to RFC 3986, sec. 2.2, with '%' added. The
// '%' character is not specified as reserved but it effectively is because
// "Percent sign serves as the indicator for percent-encoded octets, it must
// be percent-encoded (...)" [RFC 3986, sec. 2.4].
const RESERVED_CHARS: &[char] = &[
    ':', '/', '?', '#', '[', ']', '@', '!', '$', '&', '\'', '(', ')', '*',
    '+', ',', ';', '=', '%',
];

/// A node name, optionally qualified by its YANG module name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApiIdentifier {
    pub module: Option<String>,
    pub name: String,
}

/// One data-resource-identifier segment: an identifier plus list-key or
/// leaf-list values.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathSegment {
    pub ident: ApiIdentifier,
    pub keys: Vec<String>,
}

/// A parsed RESTCONF request target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UriPath {
    Data {
        datastore: Option<Datastore>,
        segments: Vec<PathSegment>,
    },
    Operations {
        segments: Vec<PathSegment>,
    },
    YangLibraryVersion,
}

/// A parsed `/yang/<module>[@<revision>]` target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct YangModuleRef {
    pub name: String,
    pub revision: Option<String>,
}

/// Recognized query parameters (RFC 8040, section 4.8), each at most once.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct QueryParams {
    /// `None` means unbounded.
    pub depth: Option<u32>,
    pub with_defaults: Option<WithDefaults>,
    pub content: Option<ContentFilter>,
    pub insert: Option<Insert>,
    pub point: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Insert {
    First,
    Last,
    Before,
    After,
}

/// Syntax error with the byte position and the token that was expected.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyntaxError {
    pub scope: &'static str,
    pub position: usize,
    pub expected: String,
}

// ===== impl ApiIdentifier =====

impl std::fmt::Display for ApiIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.module {
            Some(module) => write!(f, "{}:{}", module, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// ===== impl PathSegment =====

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.ident)?;
        if !self.keys.is_empty() {
            let keys = self
                .keys
                .iter()
                .map(|key| percent_encode_key(key))
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "={}", keys)?;
        }
        Ok(())
    }
}

// ===== impl SyntaxError =====

impl SyntaxError {
    fn new(
        scope: &'static str,
        position: usize,
        expected: impl Into<String>,
    ) -> SyntaxError {
        SyntaxError {
            scope,
            position,
            expected: expected.into(),
        }
    }
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Syntax error in URI {} at position {}: expected {}",
            self.scope, self.position, self.expected
        )
    }
}

impl std::error::Error for SyntaxError {}

impl From<SyntaxError> for ErrorResponse {
    fn from(error: SyntaxError) -> ErrorResponse {
        ErrorResponse::new(
            StatusCode::BAD_REQUEST,
            ErrorType::Protocol,
            ErrorTag::InvalidValue,
            error.to_string(),
        )
    }
}

// ===== global functions =====

/// Parses a RESTCONF request path (RFC 8040, section 3.5.3).
pub fn parse_uri_path(path: &str) -> Result<UriPath, SyntaxError> {
    if path == "/restconf/yang-library-version" {
        return Ok(UriPath::YangLibraryVersion);
    }

    if let Some(rest) = strip_route(path, "/restconf/data") {
        let segments = parse_segments(path, rest)?;
        return Ok(UriPath::Data {
            datastore: None,
            segments,
        });
    }

    if let Some(rest) = strip_route(path, "/restconf/operations") {
        let segments = parse_segments(path, rest)?;
        if segments.is_empty() {
            return Err(SyntaxError::new(
                "path",
                path.len(),
                "an RPC identifier",
            ));
        }
        return Ok(UriPath::Operations { segments });
    }

    if let Some(rest) = path.strip_prefix("/restconf/ds/") {
        let offset = path.len() - rest.len();
        let (datastore, rest) = parse_datastore(rest, offset)?;
        let segments = parse_segments(path, rest)?;
        return Ok(UriPath::Data {
            datastore: Some(datastore),
            segments,
        });
    }

    Err(SyntaxError::new("path", 0, "a RESTCONF resource"))
}

/// Parses a `/yang/<module>[@<revision>]` path.
pub fn parse_yang_uri(path: &str) -> Result<YangModuleRef, SyntaxError> {
    let Some(rest) = path.strip_prefix("/yang/") else {
        return Err(SyntaxError::new("path", 0, "'/yang/'"));
    };
    let offset = path.len() - rest.len();

    let (name, consumed) = take_identifier(rest)
        .ok_or_else(|| SyntaxError::new("path", offset, "a module name"))?;
    let rest = &rest[consumed..];

    if rest.is_empty() {
        return Ok(YangModuleRef {
            name: name.to_owned(),
            revision: None,
        });
    }

    let offset = offset + consumed;
    let Some(revision) = rest.strip_prefix('@') else {
        return Err(SyntaxError::new("path", offset, "'@' or end of path"));
    };
    if !is_valid_revision(revision) {
        return Err(SyntaxError::new(
            "path",
            offset + 1,
            "a YYYY-MM-DD revision",
        ));
    }

    Ok(YangModuleRef {
        name: name.to_owned(),
        revision: Some(revision.to_owned()),
    })
}

/// Parses the query string into the recognized option bundle.
pub fn parse_query_string(query: &str) -> Result<QueryParams, SyntaxError> {
    let mut params = QueryParams::default();
    if query.is_empty() {
        return Ok(params);
    }

    let mut seen = Vec::new();
    let mut offset = 0;
    for part in query.split('&') {
        let (key, value) = part.split_once('=').ok_or_else(|| {
            SyntaxError::new("querystring", offset, "'key=value'")
        })?;
        let value_offset = offset + key.len() + 1;
        let value = percent_decode(value, "querystring", value_offset)?;

        check_duplicate(!seen.contains(&key.to_owned()), offset)?;
        seen.push(key.to_owned());

        match key {
            "depth" => {
                params.depth = match value.as_str() {
                    "unbounded" => None,
                    _ => Some(value.parse::<u32>().ok().filter(|depth| {
                        (1..=65535).contains(depth)
                    }).ok_or_else(|| {
                        SyntaxError::new(
                            "querystring",
                            value_offset,
                            "an integer between 1 and 65535 or 'unbounded'",
                        )
                    })?),
                };
            }
            "with-defaults" => {
                params.with_defaults = Some(match value.as_str() {
                    "report-all" => WithDefaults::ReportAll,
                    "report-all-tagged" => WithDefaults::ReportAllTagged,
                    "trim" => WithDefaults::Trim,
                    "explicit" => WithDefaults::Explicit,
                    _ => {
                        return Err(SyntaxError::new(
                            "querystring",
                            value_offset,
                            "one of 'report-all', 'report-all-tagged', \
                             'trim', 'explicit'",
                        ));
                    }
                });
            }
            "content" => {
                params.content = Some(match value.as_str() {
                    "config" => ContentFilter::Config,
                    "nonconfig" => ContentFilter::Nonconfig,
                    "all" => ContentFilter::All,
                    _ => {
                        return Err(SyntaxError::new(
                            "querystring",
                            value_offset,
                            "one of 'config', 'nonconfig', 'all'",
                        ));
                    }
                });
            }
            "insert" => {
                params.insert = Some(match value.as_str() {
                    "first" => Insert::First,
                    "last" => Insert::Last,
                    "before" => Insert::Before,
                    "after" => Insert::After,
                    _ => {
                        return Err(SyntaxError::new(
                            "querystring",
                            value_offset,
                            "one of 'first', 'last', 'before', 'after'",
                        ));
                    }
                });
            }
            "point" => {
                params.point = Some(value);
            }
            _ => {
                return Err(SyntaxError::new(
                    "querystring",
                    offset,
                    "a recognized query parameter",
                ));
            }
        }

        offset += part.len() + 1;
    }

    // `point` and a relative `insert` come in pairs (RFC 8040, sec. 4.8.5).
    let relative_insert = matches!(
        params.insert,
        Some(Insert::Before) | Some(Insert::After)
    );
    if relative_insert != params.point.is_some() {
        return Err(SyntaxError::new(
            "querystring",
            0,
            "'insert=before|after' together with 'point'",
        ));
    }

    Ok(params)
}

/// Parses a data-resource identifier relative to an existing resource (as
/// used by YANG-Patch `target` leafs). Module qualification is optional
/// everywhere since the context module is inherited.
pub fn parse_relative_segments(
    path: &str,
) -> Result<Vec<PathSegment>, SyntaxError> {
    if !path.starts_with('/') {
        return Err(SyntaxError::new("path", 0, "'/'"));
    }

    let mut segments = Vec::new();
    let mut rest = path;
    let mut offset = 0;

    while let Some(tail) = rest.strip_prefix('/') {
        offset += 1;
        let (segment, consumed) = parse_segment(tail, offset, false)?;
        segments.push(segment);
        rest = &tail[consumed..];
        offset += consumed;
    }

    if !rest.is_empty() {
        return Err(SyntaxError::new("path", offset, "'/'"));
    }

    Ok(segments)
}

/// Serializes parsed segments back into their URI form, keys
/// percent-encoded. Reparsing the result yields an equal segment list.
pub fn segments_to_uri(segments: &[PathSegment]) -> String {
    segments
        .iter()
        .map(|segment| format!("/{}", segment))
        .collect()
}

// ===== helper functions =====

// Strips a route prefix, accepting `<route>` and `<route>/…`.
fn strip_route<'a>(path: &'a str, route: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(route)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

// Parses the `<module>:<datastore>` component of a `/restconf/ds/` path.
fn parse_datastore(
    rest: &str,
    offset: usize,
) -> Result<(Datastore, &str), SyntaxError> {
    let end = rest.find('/').unwrap_or(rest.len());
    let name = &rest[..end];
    let datastore =
        Datastore::from_qualified_name(name).ok_or_else(|| {
            SyntaxError::new("path", offset, "a known datastore")
        })?;
    Ok((datastore, &rest[end..]))
}

// Parses `/seg/seg/…` where `rest` is either empty or starts with '/'. The
// first segment must be fully qualified.
fn parse_segments(
    path: &str,
    rest: &str,
) -> Result<Vec<PathSegment>, SyntaxError> {
    let mut segments = Vec::new();
    let mut rest = rest;
    let mut offset = path.len() - rest.len();

    while let Some(tail) = rest.strip_prefix('/') {
        offset += 1;
        let (segment, consumed) =
            parse_segment(tail, offset, segments.is_empty())?;
        segments.push(segment);
        rest = &tail[consumed..];
        offset += consumed;
    }

    if !rest.is_empty() {
        return Err(SyntaxError::new("path", offset, "'/'"));
    }

    Ok(segments)
}

// Parses one `[module:]identifier[=key[,key]*]` segment.
fn parse_segment(
    input: &str,
    offset: usize,
    require_module: bool,
) -> Result<(PathSegment, usize), SyntaxError> {
    let (first, mut consumed) = take_identifier(input)
        .ok_or_else(|| SyntaxError::new("path", offset, "an identifier"))?;

    let mut module = None;
    let mut name = first.to_owned();
    if input[consumed..].starts_with(':') {
        consumed += 1;
        let (ident, len) = take_identifier(&input[consumed..]).ok_or_else(
            || SyntaxError::new("path", offset + consumed, "an identifier"),
        )?;
        module = Some(name);
        name = ident.to_owned();
        consumed += len;
    } else if require_module {
        return Err(SyntaxError::new(
            "path",
            offset + consumed,
            "':' (the first segment must be module-qualified)",
        ));
    }

    let mut keys = Vec::new();
    if input[consumed..].starts_with('=') {
        consumed += 1;
        loop {
            let (key, len) =
                take_key_value(&input[consumed..], offset + consumed)?;
            keys.push(key);
            consumed += len;
            if input[consumed..].starts_with(',') {
                consumed += 1;
            } else {
                break;
            }
        }
    }

    Ok((
        PathSegment {
            ident: ApiIdentifier { module, name },
            keys,
        },
        consumed,
    ))
}

// Takes one YANG identifier: a letter or '_', then letters, digits, '_',
// '-' and '.'.
fn take_identifier(input: &str) -> Option<(&str, usize)> {
    let mut chars = input.char_indices();
    match chars.next() {
        Some((_, ch)) if ch.is_ascii_alphabetic() || ch == '_' => (),
        _ => return None,
    }
    let end = input
        .char_indices()
        .find(|(_, ch)| {
            !(ch.is_ascii_alphanumeric()
                || *ch == '_'
                || *ch == '-'
                || *ch == '.')
        })
        .map(|(idx, _)| idx)
        .unwrap_or(input.len());
    Some((&input[..end], end))
}

// Takes one key value, stopping at ',' and '/'. Percent-encoded octets are
// decoded; raw reserved characters are rejected. Percent-encoded commas
// survive the split because splitting happens on the encoded form.
fn take_key_value(
    input: &str,
    offset: usize,
) -> Result<(String, usize), SyntaxError> {
    let mut value = Vec::new();
    let mut idx = 0;
    let bytes = input.as_bytes();

    while idx < bytes.len() {
        let ch = input[idx..].chars().next().unwrap();
        match ch {
            ',' | '/' => break,
            '%' => {
                let hex = bytes
                    .get(idx + 1..idx + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                    .ok_or_else(|| {
                        SyntaxError::new(
                            "path",
                            offset + idx,
                            "two hexadecimal digits",
                        )
                    })?;
                value.push(hex);
                idx += 3;
            }
            _ if RESERVED_CHARS.contains(&ch) => {
                return Err(SyntaxError::new(
                    "path",
                    offset + idx,
                    "an unreserved or percent-encoded character",
                ));
            }
            _ => {
                let mut buf = [0u8; 4];
                value.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                idx += ch.len_utf8();
            }
        }
    }

    let value = String::from_utf8(value).map_err(|_| {
        SyntaxError::new("path", offset, "a valid UTF-8 key value")
    })?;
    Ok((value, idx))
}

fn percent_decode(
    input: &str,
    scope: &'static str,
    offset: usize,
) -> Result<String, SyntaxError> {
    let mut value = Vec::new();
    let bytes = input.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'%' => {
                let hex = bytes
                    .get(idx + 1..idx + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                    .ok_or_else(|| {
                        SyntaxError::new(
                            scope,
                            offset + idx,
                            "two hexadecimal digits",
                        )
                    })?;
                value.push(hex);
                idx += 3;
            }
            byte => {
                value.push(byte);
                idx += 1;
            }
        }
    }
    String::from_utf8(value).map_err(|_| {
        SyntaxError::new(scope, offset, "a valid UTF-8 value")
    })
}

// Conservative encoder: everything outside the RFC 3986 unreserved set is
// percent-encoded, which keeps the output usable in Location headers.
fn percent_encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_'
            | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

fn is_valid_revision(revision: &str) -> bool {
    let bytes = revision.as_bytes();
    bytes.len() == 10
        && bytes[..4].iter().all(|byte| byte.is_ascii_digit())
        && bytes[4] == b'-'
        && bytes[5..7].iter().all(|byte| byte.is_ascii_digit())
        && bytes[7] == b'-'
        && bytes[8..10].iter().all(|byte| byte.is_ascii_digit())
}

fn check_duplicate(unique: bool, offset: usize) -> Result<(), SyntaxError> {
    if unique {
        Ok(())
    } else {
        Err(SyntaxError::new(
            "querystring",
            offset,
            "each parameter at most once",
        ))
    }
}

// ===== tests =====
