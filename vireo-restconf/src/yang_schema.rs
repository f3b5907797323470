//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use http::HeaderMap;
use vireo_datastore::{Datastore, DatastoreSession, GetParams};
use vireo_utils::yang::DataNodeRefExt;
use yang3::data::{Data, DataTree};

// Every node of the module inventory that may carry schema URLs.
const MODULE_NODES_XPATH: &str =
    "/ietf-yang-library:yang-library/module-set/module | \
     /ietf-yang-library:yang-library/module-set/module/submodule | \
     /ietf-yang-library:yang-library/module-set/import-only-module | \
     /ietf-yang-library:yang-library/module-set/import-only-module/submodule | \
     /ietf-yang-library:modules-state/module | \
     /ietf-yang-library:modules-state/module/submodule";

/// Whether the user may retrieve the given module's schema: the
/// corresponding yang-library entry must be readable for them.
pub async fn has_access_to_yang_schema(
    session: &DatastoreSession,
    name: &str,
) -> bool {
    let prefix =
        "/ietf-yang-library:yang-library/module-set[name='complete']";
    let xpath = format!(
        "{p}/module[name='{n}']/location | \
         {p}/import-only-module[name='{n}']/location | \
         {p}/module/submodule[name='{n}']/location | \
         {p}/import-only-module/submodule[name='{n}']/location",
        p = prefix,
        n = name
    );

    match session
        .get(Datastore::Operational, Some(xpath), GetParams::default())
        .await
    {
        Ok(dtree) => dtree.traverse().next().is_some(),
        Err(_) => false,
    }
}

/// Rewrites the `location` (RFC 8525) and `schema` (RFC 7895) URLs of a
/// module inventory to point at this server's schema endpoint. Without a
/// resolvable scheme and host the URLs are dropped rather than left
/// pointing elsewhere.
pub fn rewrite_schema_locations(
    dtree: &mut DataTree<'static>,
    scheme_and_host: Option<&str>,
    url_prefix: &str,
) {
    let module_nodes = match dtree.find_xpath(MODULE_NODES_XPATH) {
        Ok(set) => set.map(|dnode| dnode.path()).collect::<Vec<_>>(),
        Err(_) => return,
    };

    for path in module_nodes {
        let Ok(Some(dnode)) =
            dtree.find_xpath(&path).map(|mut iter| iter.next())
        else {
            continue;
        };

        // In the yang-library tree the URL lives in a `location`
        // leaf-list, in modules-state it is a `schema` leaf. The names
        // don't collide, so both are looked up everywhere.
        let locations = dnode
            .find_xpath("location | schema")
            .map(|set| set.map(|dnode| dnode.path()).collect::<Vec<_>>())
            .unwrap_or_default();
        let had_locations = !locations.is_empty();
        for location in locations {
            if let Ok(Some(mut dnode)) =
                dtree.find_xpath(&location).map(|mut iter| iter.next())
            {
                dnode.remove();
            }
        }

        let Some(scheme_and_host) = scheme_and_host else {
            continue;
        };
        if !had_locations {
            continue;
        }

        let Ok(Some(dnode)) =
            dtree.find_xpath(&path).map(|mut iter| iter.next())
        else {
            continue;
        };
        let Some(name) = dnode.get_string_relative("name") else {
            continue;
        };
        let revision = dnode
            .get_string_relative("revision")
            .filter(|revision| !revision.is_empty());

        let leaf = if path.starts_with("/ietf-yang-library:modules-state") {
            "schema"
        } else {
            "location"
        };
        let module_ref = match revision {
            Some(revision) => format!("{}@{}", name, revision),
            None => name,
        };
        let url =
            format!("{}{}{}", scheme_and_host, url_prefix, module_ref);
        let _ = dtree.new_path(
            &format!("{}/{}", path, leaf),
            Some(&url),
            false,
        );
    }
}

/// Synthesizes `scheme://host` from the `Forwarded` header (RFC 7239) when
/// a reverse proxy supplies one.
pub fn forwarded_scheme_and_host(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers.get("forwarded")?.to_str().ok()?;
    // Only the first (closest-to-client) element matters.
    let element = forwarded.split(',').next()?;

    let mut proto = None;
    let mut host = None;
    for pair in element.split(';') {
        let (name, value) = pair.split_once('=')?;
        let value = value.trim().trim_matches('"');
        match name.trim().to_ascii_lowercase().as_str() {
            "proto" => proto = Some(value.to_owned()),
            "host" => host = Some(value.to_owned()),
            _ => (),
        }
    }

    Some(format!("{}://{}", proto?, host?))
}
