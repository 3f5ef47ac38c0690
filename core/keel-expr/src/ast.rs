use keel_types::Value;

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// A root (`record`, `old`, ...) or a bare field of `record`.
    Ident(String),
    /// `target.field`
    Member(Box<Expr>, String),
    /// `target[index]`
    Index(Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl Expr {
    /// Maximum nesting depth of this tree.
    pub fn depth(&self) -> usize {
        match self {
            Expr::Literal(_) | Expr::Ident(_) => 1,
            Expr::Member(target, _) | Expr::Unary(_, target) => 1 + target.depth(),
            Expr::Index(a, b) | Expr::Binary(_, a, b) => 1 + a.depth().max(b.depth()),
            Expr::List(items) | Expr::Call(_, items) => {
                1 + items.iter().map(Expr::depth).max().unwrap_or(0)
            }
        }
    }
}
