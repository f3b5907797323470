//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use yang3::data::{Data, DataNodeRef};
use yang3::schema::DataValue;

/// Extension methods for `DataNodeRef`.
pub trait DataNodeRefExt {
    fn exists(&self, path: &str) -> bool;
    fn get_bool(&self) -> bool;
    fn get_bool_relative(&self, path: &str) -> Option<bool>;
    fn get_u32(&self) -> u32;
    fn get_u32_relative(&self, path: &str) -> Option<u32>;
    fn get_string(&self) -> String;
    fn get_string_relative(&self, path: &str) -> Option<String>;
}

// ===== impl DataNodeRef =====

impl DataNodeRefExt for DataNodeRef<'_> {
    fn exists(&self, path: &str) -> bool {
        self.find_xpath(path).unwrap().next().is_some()
    }

    fn get_bool(&self) -> bool {
        if let DataValue::Bool(value) =
            self.value().expect("data node doesn't hold any value")
        {
            value
        } else {
            panic_wrong_dnode_type(self, "bool");
        }
    }

    fn get_bool_relative(&self, path: &str) -> Option<bool> {
        self.find_xpath(path)
            .unwrap()
            .next()
            .map(|dnode| dnode.get_bool())
    }

    fn get_u32(&self) -> u32 {
        if let DataValue::Uint32(value) =
            self.value().expect("data node doesn't hold any value")
        {
            value
        } else {
            panic_wrong_dnode_type(self, "uint32");
        }
    }

    fn get_u32_relative(&self, path: &str) -> Option<u32> {
        self.find_xpath(path)
            .unwrap()
            .next()
            .map(|dnode| dnode.get_u32())
    }

    fn get_string(&self) -> String {
        self.value_canonical()
            .expect("data node doesn't hold any value")
    }

    fn get_string_relative(&self, path: &str) -> Option<String> {
        self.find_xpath(path)
            .unwrap()
            .next()
            .map(|dnode| dnode.get_string())
    }
}

// ===== helper functions =====

fn panic_wrong_dnode_type(dnode: &DataNodeRef<'_>, expected: &str) -> ! {
    panic!(
        "wrong data node type (was expecting {}): {}",
        expected,
        dnode.path()
    );
}
