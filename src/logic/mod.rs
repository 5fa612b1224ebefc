//! Logical expression evaluation.
//!
//! [`resolve_logic_node`] evaluates an expression against a [`Scope`],
//! awaiting caller-supplied callables as it goes. [`update_scope_context`]
//! walks the same grammar without evaluating anything and only records
//! which names are read and which are declared.

/// Operator and builtin member semantics.
pub mod operators;

use async_recursion::async_recursion;
use chrono::Utc;

use crate::error::{CompileError, ErrorKind};
use crate::parser::ast::{
    AssignOp, ExprKind, Expression, LogicalOp, MemberProperty, PropertyKey, Span, UpdateOp,
};
use crate::scope::{Scope, ScopeContext};
use crate::value::{ObjectMap, Value};

use operators::{binary, get_property, set_own_property, unary};

/// Read-only identifiers resolved without consulting the scope.
pub const SPECIAL_IDENTIFIERS: &[&str] = &["$now"];

/// Failure while evaluating or analyzing an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    /// What went wrong
    pub kind: ErrorKind,
    /// Offending sub-expression
    pub span: Span,
}

impl EvalError {
    fn new(kind: ErrorKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Render against the document text.
    pub fn into_compile_error(self, source: &str) -> CompileError {
        CompileError::new(self.kind, source, self.span)
    }
}

/// Result alias for evaluation.
pub type EvalResult<T> = std::result::Result<T, EvalError>;

fn special_identifier(name: &str) -> Option<Value> {
    match name {
        "$now" => Some(Value::Date(Utc::now())),
        _ => None,
    }
}

/// Evaluate `expr` against `scope`.
pub async fn resolve_logic_node(expr: &Expression, scope: &mut Scope) -> EvalResult<Value> {
    eval(expr, scope).await
}

#[async_recursion]
async fn eval(expr: &Expression, scope: &mut Scope) -> EvalResult<Value> {
    match &expr.kind {
        ExprKind::Literal { value } => Ok(value.clone()),
        ExprKind::Identifier { name } => {
            if let Some(value) = special_identifier(name) {
                return Ok(value);
            }
            if !scope.exists(name) {
                return Ok(Value::Undefined);
            }
            scope
                .get(name)
                .map_err(|_| EvalError::new(ErrorKind::VariableNotDeclared(name.clone()), expr.span))
        }
        ExprKind::Array { elements } => {
            let mut items = Vec::with_capacity(elements.len());
            for element in elements {
                items.push(eval(element, scope).await?);
            }
            Ok(Value::Array(items))
        }
        ExprKind::Object { properties } => {
            let mut map = ObjectMap::new();
            for property in properties {
                let key = match &property.key {
                    PropertyKey::Named(name) => name.clone(),
                    PropertyKey::Computed(key) => eval(key, scope).await?.to_js_string(),
                };
                let value = eval(&property.value, scope).await?;
                map.insert(key, value);
            }
            Ok(Value::Object(map))
        }
        ExprKind::Sequence { expressions } => {
            let mut last = Value::Undefined;
            for expression in expressions {
                last = eval(expression, scope).await?;
            }
            Ok(last)
        }
        ExprKind::Unary { operator, argument } => {
            let value = eval(argument, scope).await?;
            Ok(unary(*operator, value))
        }
        ExprKind::Binary {
            operator,
            left,
            right,
        } => {
            let left = eval(left, scope).await?;
            let right = eval(right, scope).await?;
            Ok(binary(*operator, &left, &right))
        }
        ExprKind::Logical {
            operator,
            left,
            right,
        } => {
            let left = eval(left, scope).await?;
            if short_circuits(*operator, &left) {
                return Ok(left);
            }
            eval(right, scope).await
        }
        ExprKind::Conditional {
            test,
            consequent,
            alternate,
        } => {
            if eval(test, scope).await?.is_truthy() {
                eval(consequent, scope).await
            } else {
                eval(alternate, scope).await
            }
        }
        ExprKind::Assignment {
            operator,
            target,
            value,
        } => assign(expr, *operator, target, value, scope).await,
        ExprKind::Update {
            operator,
            prefix,
            argument,
        } => update(*operator, *prefix, argument, scope).await,
        ExprKind::Member { .. } | ExprKind::Call { .. } => {
            Ok(eval_link(expr, scope).await?.unwrap_or_default())
        }
        ExprKind::Chain { expression } => Ok(eval_link(expression, scope).await?.unwrap_or_default()),
    }
}

fn short_circuits(operator: LogicalOp, left: &Value) -> bool {
    match operator {
        LogicalOp::And => !left.is_truthy(),
        LogicalOp::Or => left.is_truthy(),
        LogicalOp::Nullish => !left.is_nullish(),
    }
}

/// Evaluate one link of a member/call chain. `None` means an optional link
/// short-circuited the whole chain.
#[async_recursion]
async fn eval_link(expr: &Expression, scope: &mut Scope) -> EvalResult<Option<Value>> {
    match &expr.kind {
        ExprKind::Member {
            object,
            property,
            optional,
        } => {
            let Some(target) = eval_link(object, scope).await? else {
                return Ok(None);
            };
            if *optional && target.is_nullish() {
                return Ok(None);
            }
            let key = property_key(property, scope).await?;
            match get_property(&target, &key) {
                Some(value) => Ok(Some(value)),
                None => Err(EvalError::new(
                    ErrorKind::PropertyNotExists {
                        object: describe(object),
                        property: key.to_js_string(),
                    },
                    expr.span,
                )),
            }
        }
        ExprKind::Call {
            callee,
            arguments,
            optional,
        } => {
            let Some(function) = eval_link(callee, scope).await? else {
                return Ok(None);
            };
            if *optional && function.is_nullish() {
                return Ok(None);
            }
            let mut args = Vec::with_capacity(arguments.len());
            for argument in arguments {
                args.push(eval(argument, scope).await?);
            }
            let Value::Function(function) = function else {
                return Err(EvalError::new(
                    ErrorKind::NotAFunction(describe(callee)),
                    callee.span,
                ));
            };
            tracing::trace!(callee = %describe(callee), "calling function");
            function
                .call(args)
                .await
                .map(Some)
                .map_err(|message| EvalError::new(ErrorKind::FunctionCallError(message), expr.span))
        }
        _ => eval(expr, scope).await.map(Some),
    }
}

async fn property_key(property: &MemberProperty, scope: &mut Scope) -> EvalResult<Value> {
    match property {
        MemberProperty::Named(name) => Ok(Value::String(name.clone())),
        MemberProperty::Computed(key) => eval(key, scope).await,
    }
}

/// Short source-like description of an expression for error messages.
fn describe(expr: &Expression) -> String {
    match &expr.kind {
        ExprKind::Identifier { name } => name.clone(),
        ExprKind::Member {
            object,
            property: MemberProperty::Named(name),
            optional,
        } => format!("{}{}{}", describe(object), if *optional { "?." } else { "." }, name),
        ExprKind::Member { object, .. } => format!("{}[…]", describe(object)),
        ExprKind::Call { callee, .. } => format!("{}(…)", describe(callee)),
        ExprKind::Chain { expression } => describe(expression),
        ExprKind::Literal { value } => value.to_template_string(),
        _ => "expression".to_string(),
    }
}

/// Assignable location: a root variable plus a member path.
struct Place {
    root: String,
    path: Vec<Value>,
}

#[async_recursion]
async fn resolve_place(expr: &Expression, scope: &mut Scope) -> EvalResult<Option<Place>> {
    match &expr.kind {
        ExprKind::Identifier { name } => Ok(Some(Place {
            root: name.clone(),
            path: Vec::new(),
        })),
        ExprKind::Member {
            object,
            property,
            optional: false,
        } => {
            let Some(mut place) = resolve_place(object, scope).await? else {
                return Ok(None);
            };
            place.path.push(property_key(property, scope).await?);
            Ok(Some(place))
        }
        _ => Ok(None),
    }
}

fn child_mut<'v>(container: &'v mut Value, key: &Value) -> Option<&'v mut Value> {
    match container {
        Value::Object(map) => map.get_mut(&key.to_js_string()),
        Value::Array(items) => {
            let index = key.to_js_string().parse::<usize>().ok()?;
            items.get_mut(index)
        }
        _ => None,
    }
}

/// Read the place, let `compute` derive the new value, and write it back.
/// Returns the old and the new value.
async fn modify_place<F>(
    target: &Expression,
    scope: &mut Scope,
    compute: F,
) -> EvalResult<Option<(Value, Value)>>
where
    F: FnOnce(Value) -> EvalResult<Value>,
{
    let Some(place) = resolve_place(target, scope).await? else {
        return Ok(None);
    };
    if !scope.exists(&place.root) {
        return Err(EvalError::new(
            ErrorKind::VariableNotDeclared(place.root),
            target.span,
        ));
    }
    let mut root = scope
        .get(&place.root)
        .map_err(|_| EvalError::new(ErrorKind::VariableNotDeclared(place.root.clone()), target.span))?;

    let Some((last, parents)) = place.path.split_last() else {
        let old = root;
        let new = compute(old.clone())?;
        scope.set(place.root, new.clone());
        return Ok(Some((old, new)));
    };

    let object_label = match &target.kind {
        ExprKind::Member { object, .. } => describe(object),
        _ => place.root.clone(),
    };
    let missing = |key: &Value| {
        EvalError::new(
            ErrorKind::PropertyNotExists {
                object: object_label.clone(),
                property: key.to_js_string(),
            },
            target.span,
        )
    };

    let mut container = &mut root;
    for key in parents {
        container = child_mut(container, key).ok_or_else(|| missing(key))?;
    }
    let old = child_mut(container, last)
        .map(|slot| slot.clone())
        .ok_or_else(|| missing(last))?;
    let new = compute(old.clone())?;
    if !set_own_property(container, last, new.clone()) {
        return Err(missing(last));
    }
    scope.set(place.root, root);
    Ok(Some((old, new)))
}

async fn assign(
    expr: &Expression,
    operator: AssignOp,
    target: &Expression,
    value: &Expression,
    scope: &mut Scope,
) -> EvalResult<Value> {
    if let (AssignOp::Assign, Some(name)) = (operator, target.identifier_name()) {
        let value = eval(value, scope).await?;
        scope.set(name, value.clone());
        return Ok(value);
    }

    let current = match operator {
        AssignOp::Assign => None,
        _ => {
            if let Some(name) = target.identifier_name() {
                if !scope.exists(name) {
                    return Err(EvalError::new(
                        ErrorKind::VariableNotDeclared(name.to_string()),
                        target.span,
                    ));
                }
            }
            Some(eval(target, scope).await?)
        }
    };

    let assigned = match (operator, current) {
        (AssignOp::Logical(op), Some(current)) if short_circuits(op, &current) => {
            return Ok(current);
        }
        (AssignOp::Binary(op), Some(current)) => {
            let rhs = eval(value, scope).await?;
            binary(op, &current, &rhs)
        }
        _ => eval(value, scope).await?,
    };

    let written = assigned.clone();
    match modify_place(target, scope, move |_| Ok(written)).await? {
        Some(_) => Ok(assigned),
        // Assigning into a temporary has no observable effect.
        None => {
            tracing::debug!(span = ?expr.span, "assignment to a temporary value");
            Ok(assigned)
        }
    }
}

async fn update(
    operator: UpdateOp,
    prefix: bool,
    argument: &Expression,
    scope: &mut Scope,
) -> EvalResult<Value> {
    let delta = match operator {
        UpdateOp::Increment => 1.0,
        UpdateOp::Decrement => -1.0,
    };
    let span = argument.span;
    let result = modify_place(argument, scope, move |old| match old {
        Value::Number(n) => Ok(Value::Number(n + delta)),
        other => Err(EvalError::new(
            ErrorKind::InvalidUpdate(other.to_template_string()),
            span,
        )),
    })
    .await?;

    match result {
        Some((old, new)) => Ok(if prefix { new } else { old }),
        None => Err(EvalError::new(
            ErrorKind::InvalidUpdate(describe(argument)),
            span,
        )),
    }
}

/// Record reads and declarations made by `expr` without evaluating it.
///
/// Errors are appended to `errors` so a caller can either stop at the first
/// one or keep analyzing.
pub fn update_scope_context(expr: &Expression, context: &mut ScopeContext, errors: &mut Vec<EvalError>) {
    match &expr.kind {
        ExprKind::Literal { .. } => {}
        ExprKind::Identifier { name } => read_identifier(name, expr.span, context, errors),
        ExprKind::Array { elements } => {
            for element in elements {
                update_scope_context(element, context, errors);
            }
        }
        ExprKind::Object { properties } => {
            for property in properties {
                if let PropertyKey::Computed(key) = &property.key {
                    update_scope_context(key, context, errors);
                }
                update_scope_context(&property.value, context, errors);
            }
        }
        ExprKind::Sequence { expressions } => {
            for expression in expressions {
                update_scope_context(expression, context, errors);
            }
        }
        ExprKind::Unary { argument, .. } => update_scope_context(argument, context, errors),
        ExprKind::Binary { left, right, .. } | ExprKind::Logical { left, right, .. } => {
            update_scope_context(left, context, errors);
            update_scope_context(right, context, errors);
        }
        ExprKind::Conditional {
            test,
            consequent,
            alternate,
        } => {
            update_scope_context(test, context, errors);
            update_scope_context(consequent, context, errors);
            update_scope_context(alternate, context, errors);
        }
        ExprKind::Assignment {
            operator,
            target,
            value,
        } => {
            update_scope_context(value, context, errors);
            match (operator, target.identifier_name()) {
                (AssignOp::Assign, Some(name)) => {
                    context.defined_variables.insert(name.to_string());
                }
                _ => update_scope_context(target, context, errors),
            }
        }
        ExprKind::Update { argument, .. } => update_scope_context(argument, context, errors),
        ExprKind::Member {
            object, property, ..
        } => {
            update_scope_context(object, context, errors);
            if let MemberProperty::Computed(key) = property {
                update_scope_context(key, context, errors);
            }
        }
        ExprKind::Call {
            callee, arguments, ..
        } => {
            update_scope_context(callee, context, errors);
            for argument in arguments {
                update_scope_context(argument, context, errors);
            }
        }
        ExprKind::Chain { expression } => update_scope_context(expression, context, errors),
    }
}

fn read_identifier(name: &str, span: Span, context: &mut ScopeContext, errors: &mut Vec<EvalError>) {
    if SPECIAL_IDENTIFIERS.contains(&name) || context.defined_variables.contains(name) {
        return;
    }
    match &context.only_predefined_variables {
        None => {
            context.used_undefined_variables.insert(name.to_string());
        }
        Some(allowed) if allowed.contains(name) => {}
        Some(_) => errors.push(EvalError::new(
            ErrorKind::VariableNotDeclared(name.to_string()),
            span,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_standalone_expression;
    use crate::value::Callable;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn run(source: &str, scope: &mut Scope) -> EvalResult<Value> {
        let expr = parse_standalone_expression(source).expect("parse");
        resolve_logic_node(&expr, scope).await
    }

    #[tokio::test]
    async fn arithmetic_and_assignment() {
        let mut scope = Scope::default();
        run("foo = 5", &mut scope).await.expect("assign");
        run("foo += 2", &mut scope).await.expect("compound");
        assert_eq!(run("foo", &mut scope).await.unwrap(), Value::Number(7.0));
        assert_eq!(run("foo++", &mut scope).await.unwrap(), Value::Number(7.0));
        assert_eq!(run("++foo", &mut scope).await.unwrap(), Value::Number(9.0));
        assert_eq!(run("2 ** 3 ** 2", &mut scope).await.unwrap(), Value::Number(512.0));
    }

    #[tokio::test]
    async fn undeclared_names() {
        let mut scope = Scope::default();
        assert_eq!(run("missing", &mut scope).await.unwrap(), Value::Undefined);
        let err = run("missing += 1", &mut scope).await.unwrap_err();
        assert_eq!(err.kind.code(), "variable-not-declared");
        let err = run("missing++", &mut scope).await.unwrap_err();
        assert_eq!(err.kind.code(), "variable-not-declared");
    }

    #[tokio::test]
    async fn member_assignment_requires_existing_property() {
        let mut scope = Scope::default();
        run("obj = { a: { b: 1 }, list: [1, 2] }", &mut scope).await.unwrap();
        run("obj.a.b = 5", &mut scope).await.unwrap();
        run("obj.list[1] += 3", &mut scope).await.unwrap();
        assert_eq!(run("obj.a.b", &mut scope).await.unwrap(), Value::Number(5.0));
        assert_eq!(run("obj.list[1]", &mut scope).await.unwrap(), Value::Number(5.0));

        let err = run("obj.c = 1", &mut scope).await.unwrap_err();
        assert_eq!(err.kind.code(), "property-not-exists");
        let err = run("obj.x.y = 1", &mut scope).await.unwrap_err();
        assert_eq!(err.kind.code(), "property-not-exists");
    }

    #[tokio::test]
    async fn updates_require_numbers() {
        let mut scope = Scope::new([("s", Value::from("text"))]);
        let err = run("s++", &mut scope).await.unwrap_err();
        assert_eq!(err.kind.code(), "invalid-update");
    }

    #[tokio::test]
    async fn optional_chaining_short_circuits() {
        let mut scope = Scope::new([("obj", Value::Null)]);
        assert_eq!(run("obj?.a.b.c", &mut scope).await.unwrap(), Value::Undefined);
        let err = run("obj.a", &mut scope).await.unwrap_err();
        assert_eq!(err.kind.code(), "property-not-exists");
        assert_eq!(run("obj ?? 'fallback'", &mut scope).await.unwrap(), Value::from("fallback"));
    }

    #[tokio::test]
    async fn calls_are_awaited_and_counted() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let func = Callable::new(move |args: Vec<Value>| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Number(args.len() as f64))
            }
        });
        let mut scope = Scope::new([("func", Value::Function(func))]);
        assert_eq!(run("func(1, 2)", &mut scope).await.unwrap(), Value::Number(2.0));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let err = run("nope()", &mut scope).await.unwrap_err();
        assert_eq!(err.kind.code(), "not-a-function");
    }

    #[tokio::test]
    async fn failing_callables_surface_errors() {
        let failing = Callable::sync(|_| Err("boom".to_string()));
        let mut scope = Scope::new([("fail", Value::Function(failing))]);
        let err = run("fail()", &mut scope).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::FunctionCallError("boom".into()));
    }

    #[tokio::test]
    async fn builtin_methods() {
        let mut scope = Scope::new([("name", Value::from("Ada"))]);
        assert_eq!(
            run("name.toUpperCase() + [1, 2].join('-')", &mut scope).await.unwrap(),
            Value::from("ADA1-2")
        );
        assert_eq!(run("typeof $now", &mut scope).await.unwrap(), Value::from("object"));
        assert_eq!(run("'a' in { a: 1 }", &mut scope).await.unwrap(), Value::Bool(true));
    }

    #[test]
    fn static_analysis_tracks_reads_and_declarations() {
        let mut context = ScopeContext::default();
        let mut errors = Vec::new();
        for source in ["foo = bar + 1", "foo", "baz.qux(foo)", "$now"] {
            let expr = parse_standalone_expression(source).expect("parse");
            update_scope_context(&expr, &mut context, &mut errors);
        }
        assert!(errors.is_empty());
        assert!(context.defined_variables.contains("foo"));
        let used: Vec<_> = context.used_undefined_variables.iter().cloned().collect();
        assert_eq!(used, vec!["bar".to_string(), "baz".to_string()]);
    }

    #[test]
    fn restricted_analysis_rejects_unknown_reads() {
        let mut context = ScopeContext::restricted(["allowed"]);
        let mut errors = Vec::new();
        let expr = parse_standalone_expression("allowed + other").expect("parse");
        update_scope_context(&expr, &mut context, &mut errors);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::VariableNotDeclared("other".into()));
    }
}
