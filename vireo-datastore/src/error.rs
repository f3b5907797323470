//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

//
// Type aliases.
//
pub type Result<T> = std::result::Result<T, Error>;

//
// Datastore engine errors.
//
#[derive(Debug)]
pub enum Error {
    ItemExists(String),
    ItemNotFound(String),
    DefaultValue(String),
    AccessDenied(String),
    Validation(String),
    BadInput(String),
    RpcNotFound(String),
    SubscriptionNotFound(u32),
    UnknownStream(String),
    YangInternal(yang3::Error),
    EngineGone,
}

// ===== impl Error =====

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ItemExists(path) => {
                write!(f, "Data already exists: {path}")
            }
            Error::ItemNotFound(path) => {
                write!(f, "Data missing: {path}")
            }
            Error::DefaultValue(path) => {
                write!(f, "Data holds its default value: {path}")
            }
            Error::AccessDenied(path) => {
                write!(f, "Access denied: {path}")
            }
            Error::Validation(err) => {
                write!(f, "Validation failed: {err}")
            }
            Error::BadInput(err) => {
                write!(f, "Invalid input: {err}")
            }
            Error::RpcNotFound(path) => {
                write!(f, "No handler registered for RPC: {path}")
            }
            Error::SubscriptionNotFound(id) => {
                write!(f, "Subscription not found: {id}")
            }
            Error::UnknownStream(name) => {
                write!(f, "Unknown event stream: {name}")
            }
            Error::YangInternal(err) => {
                write!(f, "YANG internal error: {err}")
            }
            Error::EngineGone => {
                write!(f, "Datastore engine is shut down")
            }
        }
    }
}

impl std::error::Error for Error {}
