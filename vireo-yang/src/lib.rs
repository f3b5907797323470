//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::sync::LazyLock as Lazy;

use maplit::hashmap;
use tracing::error;
use yang3::context::{
    Context, ContextFlags, EmbeddedModuleKey, EmbeddedModules,
};

// List of embedded YANG modules.
//
// These are the modules the gateway itself depends on. Everything modeled by
// the managed system is loaded from the configured search directories
// instead.
pub static YANG_EMBEDDED_MODULES: Lazy<EmbeddedModules> = Lazy::new(|| {
    hashmap! {
        EmbeddedModuleKey::new("ietf-datastores", Some("2018-02-14"), None, None) =>
            include_str!("../modules/ietf/ietf-datastores@2018-02-14.yang"),
        EmbeddedModuleKey::new("ietf-netconf-acm", Some("2018-02-14"), None, None) =>
            include_str!("../modules/ietf/ietf-netconf-acm@2018-02-14.yang"),
        EmbeddedModuleKey::new("ietf-restconf-subscribed-notifications", Some("2019-11-17"), None, None) =>
            include_str!("../modules/ietf/ietf-restconf-subscribed-notifications@2019-11-17.yang"),
        EmbeddedModuleKey::new("ietf-subscribed-notifications", Some("2019-09-09"), None, None) =>
            include_str!("../modules/ietf/ietf-subscribed-notifications@2019-09-09.yang"),
        EmbeddedModuleKey::new("ietf-yang-library", Some("2019-01-04"), None, None) =>
            include_str!("../modules/ietf/ietf-yang-library@2019-01-04.yang"),
        EmbeddedModuleKey::new("ietf-yang-types", Some("2013-07-15"), None, None) =>
            include_str!("../modules/ietf/ietf-yang-types@2013-07-15.yang"),
    }
});

// Modules that are always implemented.
pub static YANG_BASE_MODULES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "ietf-yang-types",
        "ietf-datastores",
        "ietf-netconf-acm",
        "ietf-yang-library",
        "ietf-subscribed-notifications",
        "ietf-restconf-subscribed-notifications",
    ]
});

// Features enabled for specific modules.
pub static YANG_FEATURES: Lazy<HashMap<&'static str, Vec<&'static str>>> =
    Lazy::new(|| {
        hashmap! {
            "ietf-subscribed-notifications" => vec![],
        }
    });

// The yang-library content identifier advertised by
// `/restconf/yang-library-version`.
pub const YANG_LIBRARY_VERSION: &str = "2019-01-04";

/// Returns the raw sources of the embedded modules as
/// `(name, revision, text)` tuples.
pub fn embedded_module_sources()
-> Vec<(&'static str, Option<&'static str>, &'static str)> {
    vec![
        (
            "ietf-datastores",
            Some("2018-02-14"),
            include_str!("../modules/ietf/ietf-datastores@2018-02-14.yang"),
        ),
        (
            "ietf-netconf-acm",
            Some("2018-02-14"),
            include_str!("../modules/ietf/ietf-netconf-acm@2018-02-14.yang"),
        ),
        (
            "ietf-restconf-subscribed-notifications",
            Some("2019-11-17"),
            include_str!(
                "../modules/ietf/ietf-restconf-subscribed-notifications@2019-11-17.yang"
            ),
        ),
        (
            "ietf-subscribed-notifications",
            Some("2019-09-09"),
            include_str!(
                "../modules/ietf/ietf-subscribed-notifications@2019-09-09.yang"
            ),
        ),
        (
            "ietf-yang-library",
            Some("2019-01-04"),
            include_str!("../modules/ietf/ietf-yang-library@2019-01-04.yang"),
        ),
        (
            "ietf-yang-types",
            Some("2013-07-15"),
            include_str!("../modules/ietf/ietf-yang-types@2013-07-15.yang"),
        ),
    ]
}

// ===== global functions =====

/// Creates an empty YANG context.
///
/// The embedded modules are always available; additional modules resolve
/// through the provided search directories.
pub fn new_context<'a>(
    search_dirs: impl IntoIterator<Item = &'a str>,
) -> Context {
    let mut ctx = Context::new(ContextFlags::NO_YANGLIBRARY)
        .expect("Failed to create YANG context");
    ctx.set_embedded_modules(&YANG_EMBEDDED_MODULES);
    for dir in search_dirs {
        if let Err(error) = ctx.set_searchdir(dir) {
            error!(%error, %dir, "failed to add YANG search directory");
        }
    }
    ctx
}

/// Loads a YANG module by name.
pub fn load_module(ctx: &mut Context, name: &str) {
    let features = YANG_FEATURES
        .get(name)
        .map(|features| features.as_slice())
        .unwrap_or_else(|| &[]);
    if let Err(error) = ctx.load_module(name, None, features) {
        error!(%error, %name, "failed to load YANG module");
        std::process::exit(1);
    }
}
