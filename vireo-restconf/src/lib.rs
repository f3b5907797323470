//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod auth;
pub mod dataformat;
pub mod errors;
pub mod handlers;
pub mod notifications;
pub mod payload;
pub mod resolver;
pub mod server;
pub mod stream;
pub mod subscriptions;
pub mod uri;
pub mod yang_patch;
pub mod yang_schema;

pub use errors::{ErrorResponse, ErrorTag, ErrorType};
pub use server::{Server, ServerOptions};
