//! Logical plans. Schemas are resolved when a node is built, so every
//! construction error surfaces before execution starts.

use std::ffi::{c_char, c_int, c_void};
use std::fmt::Write as _;
use std::sync::Arc;

use arrow::datatypes::{Field, Schema, SchemaRef};
use colbridge_core::ownership::{JoinType, ResourceKind};

use crate::error::{NativeError, Result};
use crate::exec::{self, PushBatchCallback};
use crate::expr::{Expr, ExprContext};
use crate::frame::FrameContext;
use crate::scan::{OpenStreamCallback, ReleaseUserDataCallback, StreamScan};
use crate::schema::{check_unique_names, describe_layout, same_layout, SchemaContext};
use crate::selector::{Selector, SelectorContext};
use crate::types::{borrow, free_raw, into_raw, owned_c_string, take_array, take_raw, SendPtr, Tracked};
use crate::{ffi_status, ffi_try};

#[derive(Debug, Clone)]
pub(crate) enum PlanNode {
    Frame(FrameContext),
    Scan(Arc<StreamScan>),
    Select {
        input: Box<PlanNode>,
        exprs: Vec<Expr>,
        indices: Vec<usize>,
        schema: SchemaRef,
    },
    SelectBy {
        input: Box<PlanNode>,
        selector: Selector,
        indices: Vec<usize>,
        schema: SchemaRef,
    },
    Join {
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        left_on: Vec<Expr>,
        right_on: Vec<Expr>,
        how: JoinType,
        schema: SchemaRef,
    },
    Limit {
        input: Box<PlanNode>,
        n: usize,
    },
    Concat {
        inputs: Vec<PlanNode>,
        schema: SchemaRef,
    },
}

impl PlanNode {
    pub(crate) fn schema(&self) -> SchemaRef {
        match self {
            PlanNode::Frame(frame) => frame.schema.clone(),
            PlanNode::Scan(scan) => scan.schema().clone(),
            PlanNode::Limit { input, .. } => input.schema(),
            PlanNode::Select { schema, .. }
            | PlanNode::SelectBy { schema, .. }
            | PlanNode::Join { schema, .. }
            | PlanNode::Concat { schema, .. } => schema.clone(),
        }
    }

    fn select(input: PlanNode, exprs: Vec<Expr>) -> Result<Self> {
        let in_schema = input.schema();
        let mut fields = Vec::with_capacity(exprs.len());
        let mut indices = Vec::with_capacity(exprs.len());
        for e in &exprs {
            indices.push(e.source_index(&in_schema)?);
            fields.push(e.to_field(&in_schema)?);
        }
        let schema = Schema::new(fields);
        check_unique_names(&schema)?;
        Ok(PlanNode::Select {
            input: Box::new(input),
            exprs,
            indices,
            schema: Arc::new(schema),
        })
    }

    fn select_by(input: PlanNode, selector: Selector) -> Result<Self> {
        let in_schema = input.schema();
        let indices = selector.resolve(&in_schema)?;
        let schema = Arc::new(in_schema.project(&indices)?);
        Ok(PlanNode::SelectBy {
            input: Box::new(input),
            selector,
            indices,
            schema,
        })
    }

    fn join(
        left: PlanNode,
        right: PlanNode,
        left_on: Vec<Expr>,
        right_on: Vec<Expr>,
        how: JoinType,
    ) -> Result<Self> {
        let (ls, rs) = (left.schema(), right.schema());
        if how == JoinType::Cross {
            if !left_on.is_empty() || !right_on.is_empty() {
                return Err(NativeError::Plan("cross join takes no key expressions".into()));
            }
        } else {
            if left_on.is_empty() || left_on.len() != right_on.len() {
                return Err(NativeError::Plan(format!(
                    "join needs the same non-zero number of keys on both sides, got {} and {}",
                    left_on.len(),
                    right_on.len()
                )));
            }
            for (l, r) in left_on.iter().zip(&right_on) {
                let (lf, rf) = (l.to_field(&ls)?, r.to_field(&rs)?);
                if lf.data_type() != rf.data_type() {
                    return Err(NativeError::Plan(format!(
                        "join key type mismatch: {l} is {}, {r} is {}",
                        lf.data_type(),
                        rf.data_type()
                    )));
                }
            }
        }
        let schema = join_schema(&ls, &rs, how)?;
        Ok(PlanNode::Join {
            left: Box::new(left),
            right: Box::new(right),
            left_on,
            right_on,
            how,
            schema,
        })
    }

    fn concat(inputs: Vec<PlanNode>) -> Result<Self> {
        let schema = inputs
            .first()
            .map(PlanNode::schema)
            .ok_or_else(|| NativeError::Plan("concat needs at least one input".into()))?;
        for (i, p) in inputs.iter().enumerate().skip(1) {
            let other = p.schema();
            if !same_layout(&schema, &other) {
                return Err(NativeError::SchemaMismatch(format!(
                    "concat input {i}: expected {}, got {}",
                    describe_layout(&schema),
                    describe_layout(&other)
                )));
            }
        }
        Ok(PlanNode::Concat { inputs, schema })
    }

    fn explain_into(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        let _ = match self {
            PlanNode::Frame(f) => writeln!(
                out,
                "{pad}FRAME {} rows={}",
                describe_layout(&f.schema),
                f.height()
            ),
            PlanNode::Scan(s) => writeln!(out, "{pad}SCAN {}", describe_layout(s.schema())),
            PlanNode::Select { exprs, .. } => {
                let list: Vec<String> = exprs.iter().map(ToString::to_string).collect();
                writeln!(out, "{pad}SELECT [{}]", list.join(", "))
            }
            PlanNode::SelectBy { selector, .. } => writeln!(out, "{pad}SELECT {selector}"),
            PlanNode::Join {
                left_on,
                right_on,
                how,
                ..
            } => {
                let l: Vec<String> = left_on.iter().map(ToString::to_string).collect();
                let r: Vec<String> = right_on.iter().map(ToString::to_string).collect();
                writeln!(
                    out,
                    "{pad}JOIN {how:?} [{}] = [{}]",
                    l.join(", "),
                    r.join(", ")
                )
            }
            PlanNode::Limit { n, .. } => writeln!(out, "{pad}LIMIT {n}"),
            PlanNode::Concat { inputs, .. } => writeln!(out, "{pad}CONCAT {}", inputs.len()),
        };
        match self {
            PlanNode::Frame(_) | PlanNode::Scan(_) => {}
            PlanNode::Select { input, .. }
            | PlanNode::SelectBy { input, .. }
            | PlanNode::Limit { input, .. } => input.explain_into(out, depth + 1),
            PlanNode::Join { left, right, .. } => {
                left.explain_into(out, depth + 1);
                right.explain_into(out, depth + 1);
            }
            PlanNode::Concat { inputs, .. } => {
                for p in inputs {
                    p.explain_into(out, depth + 1);
                }
            }
        }
    }
}

/// Output schema of a join. Right-side names that clash with the left get a
/// `_right` suffix; outer sides become nullable.
pub(crate) fn join_schema(left: &Schema, right: &Schema, how: JoinType) -> Result<SchemaRef> {
    if matches!(how, JoinType::Semi | JoinType::Anti) {
        return Ok(Arc::new(Schema::new(left.fields().clone())));
    }
    let left_nullable = how == JoinType::Full;
    let right_nullable = matches!(how, JoinType::Left | JoinType::Full);

    let mut fields: Vec<Field> = left
        .fields()
        .iter()
        .map(|f| f.as_ref().clone().with_nullable(f.is_nullable() || left_nullable))
        .collect();
    for f in right.fields() {
        let mut name = f.name().clone();
        while fields.iter().any(|existing| existing.name() == &name) {
            name.push_str("_right");
        }
        fields.push(
            f.as_ref()
                .clone()
                .with_name(name)
                .with_nullable(f.is_nullable() || right_nullable),
        );
    }
    let schema = Schema::new(fields);
    check_unique_names(&schema)?;
    Ok(Arc::new(schema))
}

/// Plan resource.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub(crate) root: PlanNode,
}

impl Tracked for PlanContext {
    const KIND: ResourceKind = ResourceKind::Plan;
}

impl PlanContext {
    pub(crate) fn new(root: PlanNode) -> Self {
        Self { root }
    }

    pub fn schema(&self) -> SchemaRef {
        self.root.schema()
    }

    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.root.explain_into(&mut out, 0);
        out
    }
}

/// Consumes `frame`.
///
/// # Safety
/// `frame` must be a live frame.
#[no_mangle]
pub unsafe extern "C" fn cb_plan_from_frame(frame: *mut FrameContext) -> *mut PlanContext {
    ffi_try!(std::ptr::null_mut(), {
        let frame = unsafe { take_raw(frame, "frame")? };
        into_raw(PlanContext::new(PlanNode::Frame(frame)))
    })
}

/// Scan over a host stream source. `schema` is borrowed. From this call on
/// the engine owns `user_data`: `release_cb` runs exactly once, when the last
/// plan referencing the scan is dropped, or before returning if this call
/// fails.
///
/// # Safety
/// `schema` must be a live schema; the callbacks must be safe to call from
/// the engine thread with `user_data`.
#[no_mangle]
pub unsafe extern "C" fn cb_plan_scan_stream(
    schema: *const SchemaContext,
    open_cb: Option<OpenStreamCallback>,
    release_cb: Option<ReleaseUserDataCallback>,
    user_data: *mut c_void,
) -> *mut PlanContext {
    ffi_try!(std::ptr::null_mut(), {
        let schema = unsafe { schema.as_ref() }.map(|s| s.inner.clone());
        let scan = StreamScan::try_new(schema, open_cb, release_cb, user_data)?;
        into_raw(PlanContext::new(PlanNode::Scan(Arc::new(scan))))
    })
}

/// Consumes `plan` and every expression in `exprs`.
///
/// # Safety
/// `plan` must be live; `exprs` must point to `len` live expressions.
#[no_mangle]
pub unsafe extern "C" fn cb_plan_select(
    plan: *mut PlanContext,
    exprs: *const *mut ExprContext,
    len: usize,
) -> *mut PlanContext {
    ffi_try!(std::ptr::null_mut(), {
        let plan = unsafe { take_raw(plan, "plan") };
        let exprs = unsafe { take_array(exprs, len, "exprs") };
        let exprs = exprs?.into_iter().map(|e| e.inner).collect();
        into_raw(PlanContext::new(PlanNode::select(plan?.root, exprs)?))
    })
}

/// Consumes `plan` and `selector`.
///
/// # Safety
/// Both pointers must be live.
#[no_mangle]
pub unsafe extern "C" fn cb_plan_select_by(
    plan: *mut PlanContext,
    selector: *mut SelectorContext,
) -> *mut PlanContext {
    ffi_try!(std::ptr::null_mut(), {
        let plan = unsafe { take_raw(plan, "plan") };
        let selector = unsafe { take_raw(selector, "selector") };
        let (plan, selector) = (plan?, selector?);
        into_raw(PlanContext::new(PlanNode::select_by(
            plan.root,
            selector.inner,
        )?))
    })
}

/// Consumes both plans and every key expression. `how` is a
/// [`JoinType`] code.
///
/// # Safety
/// `left` and `right` must be live; the key arrays must point to the given
/// number of live expressions.
#[no_mangle]
pub unsafe extern "C" fn cb_plan_join(
    left: *mut PlanContext,
    right: *mut PlanContext,
    left_on: *const *mut ExprContext,
    left_on_len: usize,
    right_on: *const *mut ExprContext,
    right_on_len: usize,
    how: c_int,
) -> *mut PlanContext {
    ffi_try!(std::ptr::null_mut(), {
        let left = unsafe { take_raw(left, "left") };
        let right = unsafe { take_raw(right, "right") };
        let left_on = unsafe { take_array(left_on, left_on_len, "left_on") };
        let right_on = unsafe { take_array(right_on, right_on_len, "right_on") };
        let how = JoinType::from_code(how)
            .ok_or_else(|| NativeError::InvalidArgument(format!("unknown join type {how}")))?;
        let keys = |v: Vec<ExprContext>| v.into_iter().map(|e| e.inner).collect::<Vec<_>>();
        let node = PlanNode::join(left?.root, right?.root, keys(left_on?), keys(right_on?), how)?;
        into_raw(PlanContext::new(node))
    })
}

/// Consumes `plan`.
///
/// # Safety
/// `plan` must be live.
#[no_mangle]
pub unsafe extern "C" fn cb_plan_limit(plan: *mut PlanContext, n: usize) -> *mut PlanContext {
    ffi_try!(std::ptr::null_mut(), {
        let plan = unsafe { take_raw(plan, "plan")? };
        into_raw(PlanContext::new(PlanNode::Limit {
            input: Box::new(plan.root),
            n,
        }))
    })
}

/// Consumes every plan in `plans`.
///
/// # Safety
/// `plans` must point to `len` live plans.
#[no_mangle]
pub unsafe extern "C" fn cb_plan_concat(
    plans: *const *mut PlanContext,
    len: usize,
) -> *mut PlanContext {
    ffi_try!(std::ptr::null_mut(), {
        let plans = unsafe { take_array(plans, len, "plans")? };
        let node = PlanNode::concat(plans.into_iter().map(|p| p.root).collect())?;
        into_raw(PlanContext::new(node))
    })
}

/// New, owned output schema.
///
/// # Safety
/// `plan` must be live.
#[no_mangle]
pub unsafe extern "C" fn cb_plan_schema(plan: *const PlanContext) -> *mut SchemaContext {
    ffi_try!(std::ptr::null_mut(), {
        into_raw(SchemaContext::new(unsafe { borrow(plan, "plan")? }.schema()))
    })
}

/// # Safety
/// `plan` must be live.
#[no_mangle]
pub unsafe extern "C" fn cb_plan_explain(plan: *const PlanContext) -> *mut c_char {
    ffi_try!(std::ptr::null_mut(), {
        owned_c_string(unsafe { borrow(plan, "plan")? }.explain())
    })
}

/// Execute on the engine thread and materialize. Consumes `plan`.
///
/// # Safety
/// `plan` must be live.
#[no_mangle]
pub unsafe extern "C" fn cb_plan_collect(plan: *mut PlanContext) -> *mut FrameContext {
    ffi_try!(std::ptr::null_mut(), {
        let plan = unsafe { take_raw(plan, "plan")? };
        into_raw(exec::collect(plan.root)?)
    })
}

/// Execute on the engine thread, pushing every non-empty output batch to
/// `push_cb`. Consumes `plan`. Returns 0 once the plan is exhausted, -1 on
/// any engine error or when the callback returns non-zero.
///
/// # Safety
/// `plan` must be live; `push_cb` must be safe to call from the engine
/// thread with `user_data` until this call returns.
#[no_mangle]
pub unsafe extern "C" fn cb_plan_sink_batches(
    plan: *mut PlanContext,
    push_cb: Option<PushBatchCallback>,
    user_data: *mut c_void,
) -> c_int {
    ffi_status!({
        let plan = unsafe { take_raw(plan, "plan")? };
        let push = push_cb.ok_or(NativeError::NullPointer("push_cb"))?;
        exec::sink(plan.root, push, SendPtr::new(user_data))?;
    })
}

/// # Safety
/// `plan` must be live.
#[no_mangle]
pub unsafe extern "C" fn cb_plan_clone(plan: *const PlanContext) -> *mut PlanContext {
    ffi_try!(std::ptr::null_mut(), {
        into_raw(unsafe { borrow(plan, "plan")? }.clone())
    })
}

/// # Safety
/// `plan` must be null or a live plan not freed before.
#[no_mangle]
pub unsafe extern "C" fn cb_plan_free(plan: *mut PlanContext) {
    unsafe { free_raw(plan) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::DataType;

    fn frame_node(fields: Vec<Field>) -> PlanNode {
        PlanNode::Frame(FrameContext::empty(Arc::new(Schema::new(fields))))
    }

    #[test]
    fn join_schema_suffixes_and_nullability() {
        let l = Schema::new(vec![Field::new("k", DataType::Int64, false)]);
        let r = Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Utf8, false),
        ]);
        let s = join_schema(&l, &r, JoinType::Left).unwrap();
        let names: Vec<_> = s.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["k", "k_right", "v"]);
        assert!(!s.field(0).is_nullable());
        assert!(s.field(1).is_nullable());

        let full = join_schema(&l, &r, JoinType::Full).unwrap();
        assert!(full.field(0).is_nullable());

        let semi = join_schema(&l, &r, JoinType::Semi).unwrap();
        assert_eq!(semi.fields().len(), 1);
    }

    #[test]
    fn join_key_types_must_match() {
        let l = frame_node(vec![Field::new("k", DataType::Int64, false)]);
        let r = frame_node(vec![Field::new("k", DataType::Utf8, false)]);
        let err = PlanNode::join(l, r, vec![Expr::col("k")], vec![Expr::col("k")], JoinType::Inner)
            .unwrap_err();
        assert!(err.to_string().contains("type mismatch"));
    }

    #[test]
    fn select_rejects_duplicate_outputs() {
        let input = frame_node(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Int32, true),
        ]);
        let res = PlanNode::select(input, vec![Expr::col("a"), Expr::col("b").alias("a")]);
        assert!(res.is_err());
    }

    #[test]
    fn explain_is_indented() {
        let input = frame_node(vec![Field::new("a", DataType::Int32, true)]);
        let plan = PlanContext::new(PlanNode::Limit {
            input: Box::new(PlanNode::select(input, vec![Expr::col("a")]).unwrap()),
            n: 3,
        });
        let text = plan.explain();
        assert!(text.starts_with("LIMIT 3\n  SELECT [col(\"a\")]\n    FRAME"));
    }

    #[test]
    fn failed_join_consumes_every_argument() {
        let before = crate::tracking::stats(ResourceKind::Expr).freed;
        let left = into_raw(PlanContext::new(frame_node(vec![Field::new(
            "k",
            DataType::Int64,
            false,
        )])));
        let key = into_raw(ExprContext::new(Expr::col("k")));
        let keys = [key];
        // right plan missing
        let out = unsafe {
            cb_plan_join(left, std::ptr::null_mut(), keys.as_ptr(), 1, std::ptr::null(), 0, 0)
        };
        assert!(out.is_null());
        assert!(crate::tracking::stats(ResourceKind::Expr).freed > before);
        crate::error::clear_last_error();
    }
}
