//! Resource kinds and the ownership contract of every native entry point.
//!
//! An [`OwnershipEdge`] is not a runtime object; it documents what a call does
//! with one pointer argument. The host maps the edges onto Rust ownership:
//! `Consume` takes the handle by value, `Borrow` takes `&self`, `Clone` asks
//! the engine for an independent copy first.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kinds of native resources that cross the boundary. The discriminants are
/// part of the C ABI (`cb_resource_live_count(kind)`).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Plan = 0,
    Frame = 1,
    Column = 2,
    Expr = 3,
    Schema = 4,
    Selector = 5,
    DataType = 6,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Plan,
        ResourceKind::Frame,
        ResourceKind::Column,
        ResourceKind::Expr,
        ResourceKind::Schema,
        ResourceKind::Selector,
        ResourceKind::DataType,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::Plan => "plan",
            ResourceKind::Frame => "frame",
            ResourceKind::Column => "column",
            ResourceKind::Expr => "expression",
            ResourceKind::Schema => "schema",
            ResourceKind::Selector => "selector",
            ResourceKind::DataType => "type descriptor",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Join strategies understood by the engine. Codes are shared over the ABI.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner = 0,
    Left = 1,
    Full = 2,
    Cross = 3,
    Semi = 4,
    Anti = 5,
}

impl JoinType {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(JoinType::Inner),
            1 => Some(JoinType::Left),
            2 => Some(JoinType::Full),
            3 => Some(JoinType::Cross),
            4 => Some(JoinType::Semi),
            5 => Some(JoinType::Anti),
            _ => None,
        }
    }
}

/// What a boundary call does with one pointer argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnershipEdge {
    /// Native reads the pointer during the call only. Never freed, never invalidated.
    Borrow,
    /// Native returns a new, independently owned pointer; the argument stays valid.
    Clone,
    /// Native takes ownership. The host must invalidate its handle right after.
    Consume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgEdge {
    pub arg: &'static str,
    pub kind: ResourceKind,
    pub edge: OwnershipEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEdges {
    pub call: &'static str,
    pub args: &'static [ArgEdge],
}

const fn arg(arg: &'static str, kind: ResourceKind, edge: OwnershipEdge) -> ArgEdge {
    ArgEdge { arg, kind, edge }
}

use OwnershipEdge::{Borrow, Clone as CloneEdge, Consume};
use ResourceKind as K;

/// Per-call-site edge table for every native entry point that takes a
/// resource pointer. Free functions are listed for completeness: they
/// consume their argument.
pub const EDGE_TABLE: &[CallEdges] = &[
    // datatype
    CallEdges { call: "cb_datatype_export", args: &[arg("dt", K::DataType, Borrow)] },
    CallEdges { call: "cb_datatype_to_string", args: &[arg("dt", K::DataType, Borrow)] },
    CallEdges { call: "cb_datatype_clone", args: &[arg("dt", K::DataType, CloneEdge)] },
    CallEdges { call: "cb_datatype_free", args: &[arg("dt", K::DataType, Consume)] },
    // schema
    CallEdges { call: "cb_schema_new", args: &[arg("dtypes", K::DataType, Borrow)] },
    CallEdges { call: "cb_schema_len", args: &[arg("schema", K::Schema, Borrow)] },
    CallEdges { call: "cb_schema_field_name", args: &[arg("schema", K::Schema, Borrow)] },
    CallEdges { call: "cb_schema_field_dtype", args: &[arg("schema", K::Schema, Borrow)] },
    CallEdges { call: "cb_schema_export", args: &[arg("schema", K::Schema, Borrow)] },
    CallEdges { call: "cb_schema_clone", args: &[arg("schema", K::Schema, CloneEdge)] },
    CallEdges { call: "cb_schema_free", args: &[arg("schema", K::Schema, Consume)] },
    // expr
    CallEdges { call: "cb_expr_alias", args: &[arg("expr", K::Expr, Consume)] },
    CallEdges { call: "cb_expr_to_string", args: &[arg("expr", K::Expr, Borrow)] },
    CallEdges { call: "cb_expr_clone", args: &[arg("expr", K::Expr, CloneEdge)] },
    CallEdges { call: "cb_expr_free", args: &[arg("expr", K::Expr, Consume)] },
    // selector
    CallEdges {
        call: "cb_selector_or",
        args: &[arg("lhs", K::Selector, Consume), arg("rhs", K::Selector, Consume)],
    },
    CallEdges { call: "cb_selector_exclude", args: &[arg("selector", K::Selector, Consume)] },
    CallEdges { call: "cb_selector_clone", args: &[arg("selector", K::Selector, CloneEdge)] },
    CallEdges { call: "cb_selector_free", args: &[arg("selector", K::Selector, Consume)] },
    // column
    CallEdges { call: "cb_column_len", args: &[arg("column", K::Column, Borrow)] },
    CallEdges { call: "cb_column_null_count", args: &[arg("column", K::Column, Borrow)] },
    CallEdges { call: "cb_column_name", args: &[arg("column", K::Column, Borrow)] },
    CallEdges { call: "cb_column_rename", args: &[arg("column", K::Column, Borrow)] },
    CallEdges { call: "cb_column_export", args: &[arg("column", K::Column, Borrow)] },
    CallEdges { call: "cb_column_clone", args: &[arg("column", K::Column, CloneEdge)] },
    CallEdges { call: "cb_column_free", args: &[arg("column", K::Column, Consume)] },
    // frame
    CallEdges { call: "cb_frame_height", args: &[arg("frame", K::Frame, Borrow)] },
    CallEdges { call: "cb_frame_width", args: &[arg("frame", K::Frame, Borrow)] },
    CallEdges { call: "cb_frame_num_batches", args: &[arg("frame", K::Frame, Borrow)] },
    CallEdges { call: "cb_frame_schema", args: &[arg("frame", K::Frame, Borrow)] },
    CallEdges { call: "cb_frame_column", args: &[arg("frame", K::Frame, Borrow)] },
    CallEdges { call: "cb_frame_export_batch", args: &[arg("frame", K::Frame, Borrow)] },
    CallEdges { call: "cb_frame_clone", args: &[arg("frame", K::Frame, CloneEdge)] },
    CallEdges { call: "cb_frame_free", args: &[arg("frame", K::Frame, Consume)] },
    // plan
    CallEdges { call: "cb_plan_from_frame", args: &[arg("frame", K::Frame, Consume)] },
    CallEdges { call: "cb_plan_scan_stream", args: &[arg("schema", K::Schema, Borrow)] },
    CallEdges {
        call: "cb_plan_select",
        args: &[arg("plan", K::Plan, Consume), arg("exprs", K::Expr, Consume)],
    },
    CallEdges {
        call: "cb_plan_select_by",
        args: &[arg("plan", K::Plan, Consume), arg("selector", K::Selector, Consume)],
    },
    CallEdges {
        call: "cb_plan_join",
        args: &[
            arg("left", K::Plan, Consume),
            arg("right", K::Plan, Consume),
            arg("left_on", K::Expr, Consume),
            arg("right_on", K::Expr, Consume),
        ],
    },
    CallEdges { call: "cb_plan_limit", args: &[arg("plan", K::Plan, Consume)] },
    CallEdges { call: "cb_plan_concat", args: &[arg("plans", K::Plan, Consume)] },
    CallEdges { call: "cb_plan_schema", args: &[arg("plan", K::Plan, Borrow)] },
    CallEdges { call: "cb_plan_explain", args: &[arg("plan", K::Plan, Borrow)] },
    CallEdges { call: "cb_plan_collect", args: &[arg("plan", K::Plan, Consume)] },
    CallEdges { call: "cb_plan_sink_batches", args: &[arg("plan", K::Plan, Consume)] },
    CallEdges { call: "cb_plan_clone", args: &[arg("plan", K::Plan, CloneEdge)] },
    CallEdges { call: "cb_plan_free", args: &[arg("plan", K::Plan, Consume)] },
];

/// Arrow C Data Interface structs that cross the boundary next to the
/// resource pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArrowStruct {
    Schema,
    Array,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrowArgEdge {
    pub call: &'static str,
    pub arg: &'static str,
    pub kind: ArrowStruct,
    pub edge: OwnershipEdge,
}

const fn arrow_arg(
    call: &'static str,
    arg: &'static str,
    kind: ArrowStruct,
    edge: OwnershipEdge,
) -> ArrowArgEdge {
    ArrowArgEdge { call, arg, kind, edge }
}

/// Edges for Arrow structs handed *to* the engine. Schema structs are only
/// read: the caller keeps the release obligation and frees the struct after
/// the call, success or not. Array and stream structs are moved out and left
/// released.
pub const ARROW_EDGES: &[ArrowArgEdge] = &[
    arrow_arg("cb_datatype_from_arrow", "schema", ArrowStruct::Schema, Borrow),
    arrow_arg("cb_schema_from_arrow", "schema", ArrowStruct::Schema, Borrow),
    arrow_arg("cb_column_from_arrow", "schema", ArrowStruct::Schema, Borrow),
    arrow_arg("cb_column_from_arrow", "array", ArrowStruct::Array, Consume),
    arrow_arg("cb_frame_from_arrow", "schema", ArrowStruct::Schema, Borrow),
    arrow_arg("cb_frame_from_arrow", "array", ArrowStruct::Array, Consume),
    arrow_arg("cb_frame_from_stream", "stream", ArrowStruct::Stream, Consume),
];

pub fn arrow_edge_of(call: &str, arg: &str) -> Option<OwnershipEdge> {
    ARROW_EDGES
        .iter()
        .find(|e| e.call == call && e.arg == arg)
        .map(|e| e.edge)
}

/// Look up the edge a call applies to one of its arguments.
pub fn edge_of(call: &str, arg: &str) -> Option<OwnershipEdge> {
    EDGE_TABLE
        .iter()
        .find(|c| c.call == call)
        .and_then(|c| c.args.iter().find(|a| a.arg == arg))
        .map(|a| a.edge)
}

/// Calls that consume at least one resource of `kind`.
pub fn consuming_calls(kind: ResourceKind) -> impl Iterator<Item = &'static str> {
    EDGE_TABLE
        .iter()
        .filter(move |c| c.args.iter().any(|a| a.kind == kind && a.edge == Consume))
        .map(|c| c.call)
}
