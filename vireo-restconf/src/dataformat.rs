//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use http::{HeaderMap, StatusCode};
use yang3::data::DataFormat;

use crate::errors::{ErrorResponse, ErrorTag, ErrorType};

pub const MIME_JSON: &str = "application/yang-data+json";
pub const MIME_XML: &str = "application/yang-data+xml";
pub const MIME_PATCH_JSON: &str = "application/yang-patch+json";
pub const MIME_PATCH_XML: &str = "application/yang-patch+xml";
pub const MIME_YANG: &str = "application/yang";
pub const MIME_EVENT_STREAM: &str = "text/event-stream";

/// Negotiated encodings for one request: the request body encoding (when a
/// body is present) and the response encoding.
#[derive(Clone, Copy, Debug)]
pub struct DataFormats {
    pub request: Option<DataFormat>,
    pub response: DataFormat,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MimeTypeWildcards {
    Allowed,
    Forbidden,
}

// One entry of an Accept header, already stripped of its parameters.
#[derive(Debug)]
struct AcceptEntry {
    mime: String,
    quality: f32,
    // full type+subtype > type wildcard > full wildcard
    specificity: u8,
}

// ===== global functions =====

pub fn as_mime_type(format: DataFormat) -> &'static str {
    match format {
        DataFormat::JSON => MIME_JSON,
        DataFormat::XML => MIME_XML,
        _ => panic!("invalid data format"),
    }
}

/// Chooses the request and response data formats from the `Accept` and
/// `Content-Type` headers (RFC 8040, section 5.2).
pub fn choose_data_encoding(
    headers: &HeaderMap,
) -> Result<DataFormats, ErrorResponse> {
    let accept_types = headers
        .get(http::header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(parse_accept_header)
        .unwrap_or_default();
    // Content-Type doesn't share the Accept syntax, but it is a singleton
    // object similar to those in the Accept header (RFC 9110), and
    // recipients are advised to use the last syntactically valid member of
    // a mistakenly merged list.
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(parse_accept_header)
        .unwrap_or_default()
        .pop()
        .map(|entry| entry.mime);

    let mut res_accept = None;
    let mut res_content_type = None;

    if !accept_types.is_empty() {
        for entry in &accept_types {
            if let Some(format) = data_format_from_mime(
                &entry.mime,
                MimeTypeWildcards::Allowed,
            ) {
                res_accept = Some(format);
                break;
            }
        }

        if res_accept.is_none() {
            return Err(ErrorResponse::new(
                StatusCode::NOT_ACCEPTABLE,
                ErrorType::Application,
                ErrorTag::OperationNotSupported,
                "No requested format supported",
            ));
        }
    }

    if let Some(mime) = content_type {
        match data_format_from_mime(&mime, MimeTypeWildcards::Forbidden) {
            Some(format) => res_content_type = Some(format),
            None => {
                return Err(ErrorResponse::new(
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    ErrorType::Application,
                    ErrorTag::OperationNotSupported,
                    "content-type format value not supported",
                ));
            }
        }
    }

    // With no Accept header the response mirrors the request encoding, and
    // with no request encoding either, JSON is the server preference.
    if res_accept.is_none() {
        res_accept = res_content_type;
    }

    Ok(DataFormats {
        request: res_content_type,
        response: res_accept.unwrap_or(DataFormat::JSON),
    })
}

/// Whether the request body is a YANG-Patch document rather than a plain
/// patch.
pub fn is_yang_patch(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            let mime = value.split(';').next().unwrap_or_default().trim();
            mime == MIME_PATCH_JSON || mime == MIME_PATCH_XML
        })
        .unwrap_or(false)
}

// ===== helper functions =====

// Parses an Accept-style header into entries ordered by quality (higher
// first, stable), ties broken by specificity (typed media over wildcards).
fn parse_accept_header(value: &str) -> Vec<AcceptEntry> {
    let mut entries = Vec::new();

    for part in value.split(',') {
        let mut params = part.split(';');
        let Some(mime) = params.next().map(str::trim) else {
            continue;
        };
        if mime.is_empty() || mime.matches('/').count() != 1 {
            continue;
        }

        let mut quality = 1.0f32;
        for param in params {
            if let Some((name, val)) = param.split_once('=') {
                if name.trim() == "q" {
                    if let Ok(parsed) = val.trim().parse::<f32>() {
                        quality = parsed.clamp(0.0, 1.0);
                    }
                }
            }
        }

        let specificity = match mime.split_once('/') {
            Some(("*", _)) => 0,
            Some((_, "*")) => 1,
            _ => 2,
        };

        entries.push(AcceptEntry {
            mime: mime.to_owned(),
            quality,
            specificity,
        });
    }

    entries.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.specificity.cmp(&a.specificity))
    });
    entries
}

fn mime_match(
    provided: &str,
    application: &str,
    wildcards: MimeTypeWildcards,
) -> bool {
    let Some((provided_type, provided_subtype)) = provided.split_once('/')
    else {
        return false;
    };
    let Some((app_type, app_subtype)) = application.split_once('/') else {
        return false;
    };

    if wildcards == MimeTypeWildcards::Allowed {
        if provided_type == "*" {
            return true;
        }
        if provided_type == app_type && provided_subtype == "*" {
            return true;
        }
    }

    provided_type == app_type && provided_subtype == app_subtype
}

fn data_format_from_mime(
    mime: &str,
    wildcards: MimeTypeWildcards,
) -> Option<DataFormat> {
    if mime_match(mime, MIME_JSON, wildcards)
        || mime_match(mime, MIME_PATCH_JSON, wildcards)
    {
        Some(DataFormat::JSON)
    } else if mime_match(mime, MIME_XML, wildcards)
        || mime_match(mime, MIME_PATCH_XML, wildcards)
    {
        Some(DataFormat::XML)
    } else {
        None
    }
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                http::header::HeaderName::from_bytes(name.as_bytes())
                    .unwrap(),
                value.parse().unwrap(),
            );
        }
        headers
    }

    #[test]
    fn no_headers_defaults_to_json() {
        let formats = choose_data_encoding(&headers(&[])).unwrap();
        assert_eq!(formats.request, None);
        assert_eq!(formats.response, DataFormat::JSON);
    }

    #[test]
    fn response_mirrors_request_encoding() {
        let formats = choose_data_encoding(&headers(&[(
            "content-type",
            "application/yang-data+xml",
        )]))
        .unwrap();
        assert_eq!(formats.request, Some(DataFormat::XML));
        assert_eq!(formats.response, DataFormat::XML);
    }

    #[test]
    fn accept_overrides_request_encoding() {
        let formats = choose_data_encoding(&headers(&[
            ("content-type", "application/yang-data+json"),
            ("accept", "application/yang-data+xml"),
        ]))
        .unwrap();
        assert_eq!(formats.request, Some(DataFormat::JSON));
        assert_eq!(formats.response, DataFormat::XML);
    }

    #[test]
    fn accept_wildcards() {
        for accept in ["*/*", "application/*"] {
            let formats =
                choose_data_encoding(&headers(&[("accept", accept)]))
                    .unwrap();
            assert_eq!(formats.response, DataFormat::JSON);
        }
    }

    #[test]
    fn accept_quality_ordering() {
        let formats = choose_data_encoding(&headers(&[(
            "accept",
            "application/yang-data+json;q=0.4, \
             application/yang-data+xml;q=0.9",
        )]))
        .unwrap();
        assert_eq!(formats.response, DataFormat::XML);
    }

    #[test]
    fn accept_specificity_breaks_ties() {
        let formats = choose_data_encoding(&headers(&[(
            "accept",
            "*/*, application/yang-data+xml",
        )]))
        .unwrap();
        assert_eq!(formats.response, DataFormat::XML);
    }

    #[test]
    fn content_type_parameters_ignored() {
        let formats = choose_data_encoding(&headers(&[(
            "content-type",
            "application/yang-data+json; charset=utf-8",
        )]))
        .unwrap();
        assert_eq!(formats.request, Some(DataFormat::JSON));
    }

    #[test]
    fn content_type_wildcards_forbidden() {
        let error = choose_data_encoding(&headers(&[(
            "content-type",
            "application/*",
        )]))
        .unwrap_err();
        assert_eq!(error.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    fn unsupported_content_type() {
        let error = choose_data_encoding(&headers(&[(
            "content-type",
            "text/plain",
        )]))
        .unwrap_err();
        assert_eq!(error.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    fn not_acceptable() {
        let error = choose_data_encoding(&headers(&[(
            "accept",
            "text/html, image/png",
        )]))
        .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_ACCEPTABLE);
    }

    #[test]
    fn yang_patch_media_types() {
        assert!(is_yang_patch(&headers(&[(
            "content-type",
            "application/yang-patch+json"
        )])));
        assert!(is_yang_patch(&headers(&[(
            "content-type",
            "application/yang-patch+xml; charset=utf-8"
        )])));
        assert!(!is_yang_patch(&headers(&[(
            "content-type",
            "application/yang-data+json"
        )])));
    }
}
