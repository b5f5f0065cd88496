// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Hierarchical parameter names: interned paths with wildcard and alias
//! patterns, plus the instance-key set used for AddObject planning.

pub mod instance_set;
pub mod path;
pub mod path_set;

pub use instance_set::{InstanceKeys, InstanceSet};
pub use path::{Path, Segment};
pub use path_set::PathSet;
