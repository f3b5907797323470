//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::response::Response;
use http::{HeaderMap, Method, StatusCode};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vireo_datastore::{
    Datastore, DatastoreSession, EditOperation, GetParams, PatchEdit,
    WithDefaults,
};
use yang3::data::{Data, DataFormat, DataPrinterFlags, DataTree};
use yang3::schema::SchemaNodeKind;

use crate::dataformat::{
    self, DataFormats, MIME_EVENT_STREAM, MIME_YANG, choose_data_encoding,
};
use crate::errors::{ErrorResponse, ErrorTag, ErrorType, escape_xml};
use crate::notifications::{self, yang_date_time};
use crate::payload;
use crate::resolver::{self, ResolvedPath};
use crate::server::AppState;
use crate::stream::EventStream;
use crate::subscriptions::{self, EstablishOutput};
use crate::uri::{self, PathSegment, QueryParams, UriPath};
use crate::yang_patch;
use crate::yang_schema;

const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

const SN_NS: &str =
    "urn:ietf:params:xml:ns:yang:ietf-subscribed-notifications";
const RSN_NS: &str =
    "urn:ietf:params:xml:ns:yang:ietf-restconf-subscribed-notifications";
const ESTABLISH_SUBSCRIPTION: &str =
    "/ietf-subscribed-notifications:establish-subscription";
const UNSUPPORTED_SN_RPCS: [&str; 3] = [
    "/ietf-subscribed-notifications:modify-subscription",
    "/ietf-subscribed-notifications:delete-subscription",
    "/ietf-subscribed-notifications:kill-subscription",
];

const ALLOW_DATA_NODE: &str = "DELETE, GET, HEAD, OPTIONS, POST, PUT";
const ALLOW_DATASTORE_ROOT: &str = "GET, HEAD, OPTIONS, POST, PUT";
const ALLOW_OPERATION: &str = "OPTIONS, POST";
const ALLOW_READ_ONLY: &str = "GET, HEAD, OPTIONS";
const ACCEPT_PATCH: &str = "application/yang-data+json, \
     application/yang-data+xml, application/yang-patch+json, \
     application/yang-patch+xml";

// ===== entry points =====

/// Everything under `/restconf`.
pub async fn restconf(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let peer = peer_from_request(addr, &parts.headers);

    let formats = match choose_data_encoding(&parts.headers) {
        Ok(formats) => formats,
        Err(error) => return error.into_response(DataFormat::JSON),
    };

    let user = match authenticate(&state, &parts.headers, &peer).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    let result = dispatch_restconf(
        &state,
        &parts.method,
        &parts.uri,
        &parts.headers,
        body,
        formats,
        &user,
        &peer,
    )
    .await;

    result.unwrap_or_else(|error| {
        debug!(%peer, %error, "request failed");
        error.into_response(formats.response)
    })
}

/// `GET /yang/<module>[@<revision>]`: raw schema retrieval.
pub async fn yang_schema(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let peer = peer_from_request(addr, request.headers());

    let user =
        match authenticate(&state, request.headers(), &peer).await {
            Ok(user) => user,
            Err(response) => return response,
        };

    match *request.method() {
        Method::GET | Method::HEAD => (),
        Method::OPTIONS => {
            return Response::builder()
                .status(StatusCode::OK)
                .header(http::header::ALLOW, ALLOW_READ_ONLY)
                .body(Body::empty())
                .unwrap();
        }
        _ => {
            return plain_not_found(
                StatusCode::METHOD_NOT_ALLOWED,
                "Method not allowed",
            );
        }
    }

    let module = match uri::parse_yang_uri(request.uri().path()) {
        Ok(module) => module,
        Err(_) => {
            return plain_not_found(
                StatusCode::NOT_FOUND,
                "YANG module not found",
            );
        }
    };

    let session = state.handle.session(&user);
    if !yang_schema::has_access_to_yang_schema(&session, &module.name).await
    {
        return plain_not_found(
            StatusCode::NOT_FOUND,
            "YANG module not found",
        );
    }

    match session.module_text(module.name, module.revision).await {
        Ok(Some(text)) => {
            let body = match *request.method() {
                Method::HEAD => Body::empty(),
                _ => Body::from(text),
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(http::header::CONTENT_TYPE, MIME_YANG)
                .body(body)
                .unwrap()
        }
        _ => plain_not_found(StatusCode::NOT_FOUND, "YANG module not found"),
    }
}

/// `GET /streams/NETCONF/<encoding>`: the firehose of every notification.
pub async fn netconf_stream(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(encoding): Path<String>,
    request: Request,
) -> Response {
    let peer = peer_from_request(addr, request.headers());

    let format = match encoding.as_str() {
        "JSON" => DataFormat::JSON,
        "XML" => DataFormat::XML,
        _ => {
            return plain_not_found(StatusCode::NOT_FOUND, "No such stream");
        }
    };

    if let Err(response) =
        authenticate(&state, request.headers(), &peer).await
    {
        return response;
    }

    info!(%peer, %encoding, "NETCONF notification stream attached");
    let (stream, body) = EventStream::new(peer);
    stream.start_keepalive(state.options.keepalive_interval);
    stream.watch_termination(state.shutdown.subscribe());
    notifications::relay_notifications(
        &stream,
        state.handle.notifications(),
        format,
    );

    event_stream_response(body)
}

/// `GET /streams/subscribed/<uuid>`: one dynamic subscription.
pub async fn subscribed_stream(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(uuid): Path<String>,
    request: Request,
) -> Response {
    let peer = peer_from_request(addr, request.headers());

    let user =
        match authenticate(&state, request.headers(), &peer).await {
            Ok(user) => user,
            Err(response) => return response,
        };

    let Ok(uuid) = Uuid::parse_str(&uuid) else {
        return plain_not_found(StatusCode::NOT_FOUND, "No such stream");
    };

    let Some(subscription) = state.subscriptions.attach(uuid, &user) else {
        return plain_not_found(StatusCode::NOT_FOUND, "No such stream");
    };
    let Some(events) = state.subscriptions.client_connected(&subscription)
    else {
        return plain_not_found(StatusCode::NOT_FOUND, "No such stream");
    };

    info!(%subscription, %peer, "subscription stream attached");
    let (stream, body) = EventStream::new(peer);
    stream.start_keepalive(state.options.keepalive_interval);
    stream.watch_termination(state.shutdown.subscribe());
    subscriptions::spawn_subscription_stream(
        &state.subscriptions,
        subscription,
        &stream,
        events,
    );

    event_stream_response(body)
}

// ===== dispatcher =====

#[allow(clippy::too_many_arguments)]
async fn dispatch_restconf(
    state: &Arc<AppState>,
    method: &Method,
    uri: &http::Uri,
    headers: &HeaderMap,
    body: Body,
    formats: DataFormats,
    user: &str,
    peer: &str,
) -> Result<Response, ErrorResponse> {
    let path = uri::parse_uri_path(uri.path())?;
    let query = uri::parse_query_string(uri.query().unwrap_or_default())?;

    let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|error| {
            ErrorResponse::new(
                StatusCode::BAD_REQUEST,
                ErrorType::Protocol,
                ErrorTag::MalformedMessage,
                format!("Cannot read request body: {error}"),
            )
        })?;
    let body = String::from_utf8(body.to_vec()).map_err(|_| {
        ErrorResponse::new(
            StatusCode::BAD_REQUEST,
            ErrorType::Protocol,
            ErrorTag::MalformedMessage,
            "Request body is not valid UTF-8",
        )
    })?;

    debug!(%peer, %method, path = %uri.path(), %user, "dispatching request");

    let session = state.handle.session(user);
    match path {
        UriPath::YangLibraryVersion => {
            yang_library_version(method, formats.response)
        }
        UriPath::Operations { segments } => {
            operations_resource(
                state, method, headers, &segments, &body, formats, &session,
            )
            .await
        }
        UriPath::Data {
            datastore,
            segments,
        } => {
            data_resource(
                state, method, uri, headers, datastore, &segments, &body,
                &query, formats, &session,
            )
            .await
        }
    }
}

fn yang_library_version(
    method: &Method,
    format: DataFormat,
) -> Result<Response, ErrorResponse> {
    match *method {
        Method::GET | Method::HEAD => {
            let body = match format {
                DataFormat::JSON => json!({
                    "ietf-restconf:yang-library-version":
                        vireo_yang::YANG_LIBRARY_VERSION
                })
                .to_string(),
                _ => format!(
                    "<yang-library-version \
                     xmlns=\"urn:ietf:params:xml:ns:yang:ietf-restconf\">\
                     {}</yang-library-version>",
                    vireo_yang::YANG_LIBRARY_VERSION
                ),
            };
            Ok(data_response(
                StatusCode::OK,
                format,
                (*method == Method::GET).then_some(body),
            ))
        }
        Method::OPTIONS => Ok(options_response(ALLOW_READ_ONLY, false)),
        _ => Err(method_not_allowed(ALLOW_READ_ONLY)),
    }
}

// `/restconf/operations/<rpc>`.
async fn operations_resource(
    state: &Arc<AppState>,
    method: &Method,
    headers: &HeaderMap,
    segments: &[PathSegment],
    body: &str,
    formats: DataFormats,
    session: &DatastoreSession,
) -> Result<Response, ErrorResponse> {
    let ctx = state.handle.context();
    let resolved = resolver::resolve(ctx, segments)?;

    match resolved.kind {
        SchemaNodeKind::Rpc => (),
        SchemaNodeKind::Action => {
            return Err(ErrorResponse::new(
                StatusCode::BAD_REQUEST,
                ErrorType::Protocol,
                ErrorTag::OperationNotSupported,
                format!(
                    "'{}' is an action node, invoke it via a data resource \
                     path under /restconf/data",
                    resolved.schema_path
                ),
            ));
        }
        _ => {
            return Err(ErrorResponse::new(
                StatusCode::BAD_REQUEST,
                ErrorType::Protocol,
                ErrorTag::OperationNotSupported,
                format!("'{}' is not an RPC node", resolved.schema_path),
            ));
        }
    }

    match *method {
        Method::POST => {
            invoke_operation(state, headers, &resolved, body, formats, session)
                .await
        }
        Method::OPTIONS => Ok(options_response(ALLOW_OPERATION, false)),
        _ => Err(method_not_allowed(ALLOW_OPERATION)),
    }
}

// `/restconf/data[/<resource>]` and `/restconf/ds/<datastore>[/<resource>]`.
#[allow(clippy::too_many_arguments)]
async fn data_resource(
    state: &Arc<AppState>,
    method: &Method,
    uri: &http::Uri,
    headers: &HeaderMap,
    datastore: Option<Datastore>,
    segments: &[PathSegment],
    body: &str,
    query: &QueryParams,
    formats: DataFormats,
    session: &DatastoreSession,
) -> Result<Response, ErrorResponse> {
    let ctx = state.handle.context();

    // Reads default to the operational datastore, writes to running.
    let read_datastore = datastore.unwrap_or(Datastore::Operational);
    let write_datastore = datastore.unwrap_or(Datastore::Running);

    if query.insert.is_some() || query.point.is_some() {
        return Err(ErrorResponse::new(
            StatusCode::BAD_REQUEST,
            ErrorType::Protocol,
            ErrorTag::OperationNotSupported,
            "The 'insert' and 'point' query parameters are not supported",
        ));
    }

    let is_write = matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    if is_write && write_datastore == Datastore::Operational {
        return Err(ErrorResponse::new(
            StatusCode::METHOD_NOT_ALLOWED,
            ErrorType::Protocol,
            ErrorTag::OperationNotSupported,
            "The operational datastore is read-only",
        )
        .with_allow(ALLOW_READ_ONLY));
    }

    // The datastore root resource.
    if segments.is_empty() {
        return datastore_root_resource(
            state,
            method,
            uri,
            headers,
            read_datastore,
            write_datastore,
            body,
            query,
            formats,
            session,
        )
        .await;
    }

    let resolved = resolver::resolve(ctx, segments)?;

    // RPCs and actions are not data resources.
    if resolved.is_operation() {
        return match *method {
            Method::GET | Method::HEAD => Err(ErrorResponse::new(
                StatusCode::BAD_REQUEST,
                ErrorType::Application,
                ErrorTag::OperationFailed,
                format!("'{}' is not a data resource", resolved.schema_path),
            )),
            Method::OPTIONS => Ok(options_response(ALLOW_OPERATION, false)),
            Method::POST => {
                if resolved.kind == SchemaNodeKind::Rpc {
                    Err(ErrorResponse::new(
                        StatusCode::BAD_REQUEST,
                        ErrorType::Protocol,
                        ErrorTag::OperationNotSupported,
                        format!(
                            "'{}' is an RPC node, invoke it via \
                             /restconf/operations",
                            resolved.schema_path
                        ),
                    ))
                } else {
                    invoke_operation(
                        state, headers, &resolved, body, formats, session,
                    )
                    .await
                }
            }
            _ => Err(ErrorResponse::new(
                StatusCode::METHOD_NOT_ALLOWED,
                ErrorType::Protocol,
                ErrorTag::OperationNotSupported,
                format!(
                    "'{}' is an RPC/Action node",
                    resolved.schema_path
                ),
            )
            .with_allow(ALLOW_OPERATION)),
        };
    }

    match *method {
        Method::GET | Method::HEAD => {
            get_data(
                state,
                method,
                headers,
                read_datastore,
                Some(&resolved),
                query,
                formats,
                session,
            )
            .await
        }
        Method::OPTIONS => Ok(options_response(ALLOW_DATA_NODE, true)),
        Method::POST => {
            create_resource(
                state,
                uri,
                write_datastore,
                segments,
                Some(&resolved),
                body,
                formats,
                session,
            )
            .await
        }
        Method::PUT => {
            let member = payload::payload_top_member(
                ctx,
                body,
                request_format(formats),
            )?;
            check_payload_identity(&member, &resolved)?;

            let tree = payload::parse_payload(
                ctx,
                resolved.ancestors(),
                body,
                request_format(formats),
            )?;
            if tree.find_path(&resolved.xpath).is_err() {
                return Err(ErrorResponse::new(
                    StatusCode::BAD_REQUEST,
                    ErrorType::Application,
                    ErrorTag::OperationFailed,
                    "List key values in the data differ from the key \
                     values in the URI",
                )
                .with_path(resolved.xpath.clone()));
            }

            let created = session
                .replace(write_datastore, resolved.xpath.clone(), tree)
                .await?;
            if created {
                Ok(created_response(uri.path()))
            } else {
                Ok(no_content_response())
            }
        }
        Method::PATCH => {
            patch_resource(
                state,
                write_datastore,
                segments,
                Some(&resolved),
                headers,
                body,
                formats,
                session,
            )
            .await
        }
        Method::DELETE => {
            session
                .delete(write_datastore, resolved.xpath.clone())
                .await?;
            Ok(no_content_response())
        }
        _ => Err(method_not_allowed(ALLOW_DATA_NODE)),
    }
}

// Methods against `/restconf/data` itself.
#[allow(clippy::too_many_arguments)]
async fn datastore_root_resource(
    state: &Arc<AppState>,
    method: &Method,
    uri: &http::Uri,
    headers: &HeaderMap,
    read_datastore: Datastore,
    write_datastore: Datastore,
    body: &str,
    query: &QueryParams,
    formats: DataFormats,
    session: &DatastoreSession,
) -> Result<Response, ErrorResponse> {
    let ctx = state.handle.context();

    match *method {
        Method::GET | Method::HEAD => {
            get_data(
                state,
                method,
                headers,
                read_datastore,
                None,
                query,
                formats,
                session,
            )
            .await
        }
        Method::OPTIONS => Ok(options_response(ALLOW_DATASTORE_ROOT, true)),
        Method::POST => {
            create_resource(
                state,
                uri,
                write_datastore,
                &[],
                None,
                body,
                formats,
                session,
            )
            .await
        }
        Method::PUT => {
            payload::payload_top_member(ctx, body, request_format(formats))?;
            let tree = payload::parse_payload(
                ctx,
                &[],
                body,
                request_format(formats),
            )?;
            session
                .replace(write_datastore, String::new(), tree)
                .await?;
            Ok(no_content_response())
        }
        Method::PATCH => {
            patch_resource(
                state,
                write_datastore,
                &[],
                None,
                headers,
                body,
                formats,
                session,
            )
            .await
        }
        _ => Err(method_not_allowed(ALLOW_DATASTORE_ROOT)),
    }
}

// GET/HEAD of a data resource or a whole datastore.
#[allow(clippy::too_many_arguments)]
async fn get_data(
    state: &Arc<AppState>,
    method: &Method,
    headers: &HeaderMap,
    datastore: Datastore,
    resolved: Option<&ResolvedPath>,
    query: &QueryParams,
    formats: DataFormats,
    session: &DatastoreSession,
) -> Result<Response, ErrorResponse> {
    let params = GetParams {
        max_depth: query.depth,
        content: query.content.unwrap_or_default(),
    };
    let mut dtree = session
        .get(
            datastore,
            resolved.map(|resolved| resolved.xpath.clone()),
            params,
        )
        .await?;

    // Schema URLs always point at this server.
    yang_schema::rewrite_schema_locations(
        &mut dtree,
        yang_schema::forwarded_scheme_and_host(headers).as_deref(),
        &state.options.yang_url_prefix,
    );

    let flags = printer_flags(query.with_defaults);
    let printed = match resolved {
        Some(resolved) => {
            let dnode = dtree.find_path(&resolved.xpath).map_err(|_| {
                ErrorResponse::new(
                    StatusCode::NOT_FOUND,
                    ErrorType::Application,
                    ErrorTag::InvalidValue,
                    "Request could not be completed because the relevant \
                     data model content does not exist.",
                )
            })?;
            dnode
                .print_string(formats.response, flags)
                .map_err(internal_error)?
        }
        None => dtree
            .print_string(
                formats.response,
                flags | DataPrinterFlags::WITH_SIBLINGS,
            )
            .map_err(internal_error)?,
    };

    let printed = match (printed.is_empty(), formats.response) {
        (true, DataFormat::JSON) => "{}".to_owned(),
        _ => printed,
    };

    Ok(data_response(
        StatusCode::OK,
        formats.response,
        (*method == Method::GET).then_some(printed),
    ))
}

// POST against a data resource: create exactly one child resource.
#[allow(clippy::too_many_arguments)]
async fn create_resource(
    state: &Arc<AppState>,
    uri: &http::Uri,
    datastore: Datastore,
    segments: &[PathSegment],
    resolved: Option<&ResolvedPath>,
    body: &str,
    formats: DataFormats,
    session: &DatastoreSession,
) -> Result<Response, ErrorResponse> {
    let ctx = state.handle.context();
    let format = request_format(formats);

    let member = payload::payload_top_member(ctx, body, format)?;
    if member.count != 1 {
        return Err(ErrorResponse::new(
            StatusCode::BAD_REQUEST,
            ErrorType::Application,
            ErrorTag::OperationFailed,
            "Expected exactly one top-level node in the data",
        ));
    }

    // Resolving URI + child name verifies that the payload names an
    // instantiable child of the target resource.
    let mut child_segments = segments.to_vec();
    child_segments.push(PathSegment {
        ident: uri::ApiIdentifier {
            module: member.module.clone(),
            name: member.name.clone(),
        },
        keys: Vec::new(),
    });
    let child = resolver::resolve(ctx, &child_segments)?;
    if child.is_operation() {
        return Err(ErrorResponse::new(
            StatusCode::BAD_REQUEST,
            ErrorType::Protocol,
            ErrorTag::OperationNotSupported,
            format!(
                "'{}' is an RPC/Action node, it cannot be created",
                child.schema_path
            ),
        ));
    }

    let ancestors = match resolved {
        Some(resolved) => resolved.segments.as_slice(),
        None => &[],
    };
    let tree = payload::parse_payload(ctx, ancestors, body, format)?;

    // The instance path of the created resource (list keys included)
    // comes from the parsed data.
    let child_dnode = match resolved {
        Some(resolved) => {
            let parent =
                tree.find_path(&resolved.xpath).map_err(|error| {
                    ErrorResponse::new(
                        StatusCode::BAD_REQUEST,
                        ErrorType::Application,
                        ErrorTag::InvalidValue,
                        error.to_string(),
                    )
                })?;
            parent
                .children()
                .find(|dnode| !dnode.schema().is_list_key())
        }
        None => dtree_first_top_node(&tree),
    };
    let Some(child_dnode) = child_dnode else {
        return Err(ErrorResponse::new(
            StatusCode::BAD_REQUEST,
            ErrorType::Protocol,
            ErrorTag::MalformedMessage,
            "Empty data tree received",
        ));
    };
    let child_xpath = child_dnode.path();
    let location = format!(
        "{}/{}",
        uri.path().trim_end_matches('/'),
        child_uri_segment(&child_dnode, &child)?
    );

    session.create(datastore, child_xpath, tree).await?;
    Ok(created_response(&location))
}

// PATCH: plain merge patch or a YANG-Patch edit list.
#[allow(clippy::too_many_arguments)]
async fn patch_resource(
    state: &Arc<AppState>,
    datastore: Datastore,
    segments: &[PathSegment],
    resolved: Option<&ResolvedPath>,
    headers: &HeaderMap,
    body: &str,
    formats: DataFormats,
    session: &DatastoreSession,
) -> Result<Response, ErrorResponse> {
    let ctx = state.handle.context();
    let format = request_format(formats);

    if dataformat::is_yang_patch(headers) {
        let patch = yang_patch::parse(body, format)?;
        debug!(patch_id = %patch.patch_id, edits = patch.edits.len(),
            "applying YANG patch");

        let mut edits = Vec::with_capacity(patch.edits.len());
        for edit in patch.edits {
            let mut target_segments = segments.to_vec();
            target_segments
                .extend(uri::parse_relative_segments(&edit.target)?);
            let target = resolver::resolve(ctx, &target_segments)?;

            let tree = match &edit.value {
                Some(value) => Some(payload::parse_payload(
                    ctx,
                    target.ancestors(),
                    value,
                    format,
                )?),
                None => None,
            };
            if tree.is_none()
                && !matches!(
                    edit.operation,
                    EditOperation::Delete | EditOperation::Remove
                )
            {
                return Err(ErrorResponse::new(
                    StatusCode::BAD_REQUEST,
                    ErrorType::Application,
                    ErrorTag::InvalidValue,
                    format!("Edit '{}' requires a value", edit.edit_id),
                ));
            }

            edits.push(PatchEdit {
                edit_id: edit.edit_id,
                operation: edit.operation,
                xpath: target.xpath,
                tree,
            });
        }

        session.patch(datastore, edits).await.map_err(
            |(edit_id, error)| {
                let mut response = ErrorResponse::from(error);
                if !edit_id.is_empty() {
                    response.message = format!(
                        "Edit '{}' failed: {}",
                        edit_id, response.message
                    );
                }
                response
            },
        )?;
        return Ok(no_content_response());
    }

    // Plain patch (RFC 8040, section 4.6.1): merge the payload into the
    // target resource.
    let member = payload::payload_top_member(ctx, body, format)?;
    let ancestors = match resolved {
        Some(resolved) => {
            check_payload_identity(&member, resolved)?;
            resolved.ancestors()
        }
        None => &[],
    };
    let tree = payload::parse_payload(ctx, ancestors, body, format)?;
    session.merge(datastore, tree).await?;
    Ok(no_content_response())
}

// POST of an RPC or action.
async fn invoke_operation(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    resolved: &ResolvedPath,
    body: &str,
    formats: DataFormats,
    session: &DatastoreSession,
) -> Result<Response, ErrorResponse> {
    let ctx = state.handle.context();

    if resolved.schema_path == ESTABLISH_SUBSCRIPTION {
        let input = payload::parse_rpc_input(
            ctx,
            &resolved.segments,
            body,
            request_format(formats),
        )?;
        let output = state
            .subscriptions
            .establish(session, formats.response, &input)
            .await?;
        let body = establish_output_body(formats.response, &output);
        return Ok(data_response(
            StatusCode::OK,
            formats.response,
            Some(body),
        ));
    }
    if UNSUPPORTED_SN_RPCS.contains(&resolved.schema_path.as_str()) {
        return Err(ErrorResponse::new(
            StatusCode::BAD_REQUEST,
            ErrorType::Protocol,
            ErrorTag::OperationNotSupported,
            format!("'{}' is not supported", resolved.schema_path),
        ));
    }

    let input = payload::parse_rpc_input(
        ctx,
        &resolved.segments,
        body,
        request_format(formats),
    )?;
    let output = session
        .rpc(resolved.schema_path.clone(), input)
        .await
        .map_err(|error| match error {
            vireo_datastore::Error::RpcNotFound(path) => ErrorResponse::new(
                StatusCode::BAD_REQUEST,
                ErrorType::Protocol,
                ErrorTag::OperationNotSupported,
                format!("No handler registered for '{path}'"),
            ),
            error => error.into(),
        })?;

    match payload::rpc_output_body(
        resolved.terminal(),
        &output,
        formats.response,
    )? {
        Some(body) => {
            Ok(data_response(StatusCode::OK, formats.response, Some(body)))
        }
        None => Ok(no_content_response()),
    }
}

// ===== helper functions =====

async fn authenticate(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    peer: &str,
) -> Result<String, Response> {
    match state.auth.authorize(headers, peer).await {
        Ok(user) => Ok(user),
        Err(error) => {
            let format = choose_data_encoding(headers)
                .map(|formats| formats.response)
                .unwrap_or(DataFormat::JSON);
            if let Some(delay) = error.delay {
                info!(%peer, delay_us = delay.as_micros() as u64,
                    error = %error, "authentication failed");
                // The sleep is dropped together with the handler future if
                // the client closes first.
                tokio::time::sleep(delay).await;
            } else {
                warn!(%peer, error = %error, "authentication failed");
            }
            Err(ErrorResponse::new(
                StatusCode::UNAUTHORIZED,
                ErrorType::Protocol,
                ErrorTag::AccessDenied,
                "Access denied.",
            )
            .into_response(format))
        }
    }
}

/// Reasonably unique, but free-form string identifying the client
/// connection in logs and PAM.
fn peer_from_request(addr: SocketAddr, headers: &HeaderMap) -> String {
    let mut peer = addr.to_string();
    if let Some(forwarded) =
        headers.get("forwarded").and_then(|value| value.to_str().ok())
    {
        peer.push_str(&format!("({})", forwarded));
    }
    peer
}

fn check_payload_identity(
    member: &payload::TopMember,
    resolved: &ResolvedPath,
) -> Result<(), ErrorResponse> {
    if member.count != 1 {
        return Err(ErrorResponse::new(
            StatusCode::BAD_REQUEST,
            ErrorType::Application,
            ErrorTag::OperationFailed,
            "Expected exactly one top-level node in the data",
        )
        .with_path(resolved.xpath.clone()));
    }
    let terminal = resolved.terminal();
    if member.name != terminal.name {
        return Err(ErrorResponse::new(
            StatusCode::BAD_REQUEST,
            ErrorType::Application,
            ErrorTag::OperationFailed,
            format!(
                "Data contains invalid node: expected '{}'",
                terminal.name
            ),
        )
        .with_path(resolved.xpath.clone()));
    }
    if let Some(module) = &member.module {
        if *module != terminal.module {
            return Err(ErrorResponse::new(
                StatusCode::BAD_REQUEST,
                ErrorType::Application,
                ErrorTag::OperationFailed,
                format!(
                    "Data is from a different module than the URI node: \
                     expected '{}', got '{}'",
                    terminal.module, module
                ),
            )
            .with_path(resolved.xpath.clone()));
        }
    }
    Ok(())
}

// The URI segment identifying a freshly created child resource.
fn child_uri_segment(
    dnode: &yang3::data::DataNodeRef<'_>,
    child: &ResolvedPath,
) -> Result<String, ErrorResponse> {
    let terminal = child.terminal();
    let mut segment = format!("{}:{}", terminal.module, terminal.name);

    match terminal.kind {
        SchemaNodeKind::List => {
            let keys = dnode
                .children()
                .filter(|dnode| dnode.schema().is_list_key())
                .map(|dnode| {
                    percent_encode_segment(
                        &dnode.value_canonical().unwrap_or_default(),
                    )
                })
                .collect::<Vec<_>>();
            if !keys.is_empty() {
                segment.push('=');
                segment.push_str(&keys.join(","));
            }
        }
        SchemaNodeKind::LeafList => {
            segment.push('=');
            segment.push_str(&percent_encode_segment(
                &dnode.value_canonical().unwrap_or_default(),
            ));
        }
        _ => (),
    }

    Ok(segment)
}

fn percent_encode_segment(value: &str) -> String {
    let segment = PathSegment {
        ident: uri::ApiIdentifier {
            module: None,
            name: "x".to_owned(),
        },
        keys: vec![value.to_owned()],
    };
    // Reuse the canonical key encoder; strip the "x=" placeholder.
    segment.to_string()[2..].to_owned()
}

fn dtree_first_top_node<'a>(
    dtree: &'a DataTree<'static>,
) -> Option<yang3::data::DataNodeRef<'a>> {
    dtree.traverse().next()
}

fn establish_output_body(
    format: DataFormat,
    output: &EstablishOutput,
) -> String {
    match format {
        DataFormat::JSON => {
            let mut body = json!({
                "id": output.id,
                "ietf-restconf-subscribed-notifications:uri": output.uri,
            });
            if let Some(revision) = output.replay_start_revision {
                body["replay-start-time-revision"] =
                    json!(yang_date_time(revision));
            }
            json!({ "ietf-subscribed-notifications:output": body })
                .to_string()
        }
        _ => {
            let mut body = format!(
                "<output xmlns=\"{}\"><id>{}</id>",
                SN_NS, output.id
            );
            if let Some(revision) = output.replay_start_revision {
                body.push_str(&format!(
                    "<replay-start-time-revision>{}\
                     </replay-start-time-revision>",
                    yang_date_time(revision)
                ));
            }
            body.push_str(&format!(
                "<uri xmlns=\"{}\">{}</uri></output>",
                RSN_NS,
                escape_xml(&output.uri)
            ));
            body
        }
    }
}

fn request_format(formats: DataFormats) -> DataFormat {
    formats.request.unwrap_or(DataFormat::JSON)
}

fn printer_flags(with_defaults: Option<WithDefaults>) -> DataPrinterFlags {
    match with_defaults {
        Some(WithDefaults::ReportAll) => DataPrinterFlags::WD_ALL,
        Some(WithDefaults::ReportAllTagged) => DataPrinterFlags::WD_ALL_TAG,
        Some(WithDefaults::Trim) => DataPrinterFlags::WD_TRIM,
        Some(WithDefaults::Explicit) => DataPrinterFlags::WD_EXPLICIT,
        None => DataPrinterFlags::empty(),
    }
}

fn data_response(
    status: StatusCode,
    format: DataFormat,
    body: Option<String>,
) -> Response {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, dataformat::as_mime_type(format))
        .body(match body {
            Some(body) => Body::from(body),
            None => Body::empty(),
        })
        .unwrap()
}

fn options_response(allow: &'static str, patchable: bool) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(http::header::ALLOW, allow);
    if patchable {
        response = response.header("accept-patch", ACCEPT_PATCH);
    }
    response.body(Body::empty()).unwrap()
}

fn created_response(location: &str) -> Response {
    Response::builder()
        .status(StatusCode::CREATED)
        .header(http::header::LOCATION, location)
        .body(Body::empty())
        .unwrap()
}

fn no_content_response() -> Response {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .unwrap()
}

fn event_stream_response(body: crate::stream::EventStreamBody) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, MIME_EVENT_STREAM)
        .header(http::header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(body))
        .unwrap()
}

fn method_not_allowed(allow: &'static str) -> ErrorResponse {
    ErrorResponse::new(
        StatusCode::METHOD_NOT_ALLOWED,
        ErrorType::Protocol,
        ErrorTag::OperationNotSupported,
        "Method not allowed",
    )
    .with_allow(allow)
}

fn internal_error(error: yang3::Error) -> ErrorResponse {
    ErrorResponse::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorType::Application,
        ErrorTag::OperationFailed,
        error.to_string(),
    )
}

fn plain_not_found(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Body::from(message.to_owned()))
        .unwrap()
}
