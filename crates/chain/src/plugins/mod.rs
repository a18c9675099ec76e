// SPDX-FileCopyrightText: © 2025 Chime Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Built-in transform plugins.

pub mod file;

use crate::plugin::PluginRegistry;

/// Register every built-in plugin.
pub fn register_builtins(registry: &mut PluginRegistry) {
    registry.register(file::plugin());
}
