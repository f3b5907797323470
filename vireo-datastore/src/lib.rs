//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod api;
pub mod core;
pub mod error;
pub mod nacm;

pub use api::{
    ContentFilter, Datastore, DatastoreHandle, DatastoreSession,
    EditOperation, EngineEvent, GetParams, Notification, PatchEdit,
    SubscribeResponse, WithDefaults,
};
pub use core::{DatastoreEngine, EngineConfig};
pub use error::{Error, Result};
