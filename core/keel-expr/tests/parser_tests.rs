use keel_expr::{parse, BinaryOp, Expr, ExprError, UnaryOp, MAX_DEPTH};
use keel_types::Value;
use pretty_assertions::assert_eq;

fn ident(name: &str) -> Box<Expr> {
    Box::new(Expr::Ident(name.into()))
}

fn lit(v: impl Into<Value>) -> Box<Expr> {
    Box::new(Expr::Literal(v.into()))
}

// ── Precedence ───────────────────────────────────────────────────

#[test]
fn comparison_binds_tighter_than_and() {
    let parsed = parse("a >= 1 && b < 2").unwrap();
    assert_eq!(
        parsed,
        Expr::Binary(
            BinaryOp::And,
            Box::new(Expr::Binary(BinaryOp::Ge, ident("a"), lit(1))),
            Box::new(Expr::Binary(BinaryOp::Lt, ident("b"), lit(2))),
        )
    );
}

#[test]
fn and_binds_tighter_than_or() {
    let parsed = parse("a or b and c").unwrap();
    assert_eq!(
        parsed,
        Expr::Binary(
            BinaryOp::Or,
            ident("a"),
            Box::new(Expr::Binary(BinaryOp::And, ident("b"), ident("c"))),
        )
    );
}

#[test]
fn multiplication_before_addition() {
    let parsed = parse("1 + 2 * 3").unwrap();
    assert_eq!(
        parsed,
        Expr::Binary(
            BinaryOp::Add,
            lit(1),
            Box::new(Expr::Binary(BinaryOp::Mul, lit(2), lit(3))),
        )
    );
}

#[test]
fn not_applies_to_the_whole_comparison() {
    let parsed = parse("!a == b").unwrap();
    assert_eq!(
        parsed,
        Expr::Unary(
            UnaryOp::Not,
            Box::new(Expr::Binary(BinaryOp::Eq, ident("a"), ident("b"))),
        )
    );
}

#[test]
fn negative_literals_fold() {
    assert_eq!(parse("-5").unwrap(), Expr::Literal(Value::Int(-5)));
    assert_eq!(
        parse("-x").unwrap(),
        Expr::Unary(UnaryOp::Neg, ident("x"))
    );
}

// ── Membership and access ────────────────────────────────────────

#[test]
fn not_in_is_one_operator() {
    let parsed = parse("status not in ['void', 'paid']").unwrap();
    assert_eq!(
        parsed,
        Expr::Binary(
            BinaryOp::NotIn,
            ident("status"),
            Box::new(Expr::List(vec![
                Expr::Literal("void".into()),
                Expr::Literal("paid".into()),
            ])),
        )
    );
}

#[test]
fn member_and_index_chain() {
    let parsed = parse("related.items[0].price").unwrap();
    assert_eq!(
        parsed,
        Expr::Member(
            Box::new(Expr::Index(
                Box::new(Expr::Member(ident("related"), "items".into())),
                lit(0),
            )),
            "price".into(),
        )
    );
}

#[test]
fn calls_take_argument_lists() {
    assert_eq!(
        parse("coalesce(a, 'x')").unwrap(),
        Expr::Call(
            "coalesce".into(),
            vec![Expr::Ident("a".into()), Expr::Literal("x".into())]
        )
    );
    assert_eq!(parse("now()").unwrap(), Expr::Call("now".into(), vec![]));
}

#[test]
fn null_and_nil_are_the_same_literal() {
    assert_eq!(parse("nil").unwrap(), parse("null").unwrap());
}

// ── Errors ───────────────────────────────────────────────────────

#[test]
fn trailing_tokens_are_rejected() {
    assert!(matches!(parse("a b"), Err(ExprError::Parse { position: 2, .. })));
}

#[test]
fn comparisons_do_not_chain() {
    assert!(parse("1 < 2 < 3").is_err());
}

#[test]
fn unbalanced_parens() {
    assert!(matches!(parse("(a + b"), Err(ExprError::Parse { .. })));
    assert!(matches!(parse("len(a"), Err(ExprError::Parse { .. })));
}

#[test]
fn empty_input() {
    assert!(matches!(parse(""), Err(ExprError::Parse { position: 0, .. })));
}

#[test]
fn nesting_limit() {
    let ok = format!("{}1{}", "(".repeat(MAX_DEPTH - 1), ")".repeat(MAX_DEPTH - 1));
    assert!(parse(&ok).is_ok());

    let deep = format!("{}1{}", "(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1));
    assert_eq!(parse(&deep), Err(ExprError::TooDeep(MAX_DEPTH)));

    let nots = format!("{}true", "!".repeat(MAX_DEPTH + 1));
    assert_eq!(parse(&nots), Err(ExprError::TooDeep(MAX_DEPTH)));
}
