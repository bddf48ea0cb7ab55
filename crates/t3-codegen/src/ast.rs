//! Minimal typed AST the code generator walks.
//!
//! The lexer/preprocessor/parser are out of scope for this crate; this module
//! stands in for their output. It is deliberately not a general-purpose TADS
//! 3 parse tree -- it carries exactly the fields the generation rules in
//! `codegen`/`peephole` exercise, nothing more.

/// A parsed translation unit: a flat list of top-level statements.
///
/// `FunctionDecl` and `ObjectDecl` among these are pre-scanned in a
/// registration pass before any body is walked, so mutually recursive
/// functions and objects can reference each other by name.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub statements: Vec<Stmt>,
}

/// An index into a lexically enclosing anonymous-function's context vector;
/// `0` is the immediately enclosing scope, `1` its parent, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u16);

/// Parameter list shape for a function or method.
#[derive(Debug, Clone, Default)]
pub struct Params {
    pub fixed: Vec<String>,
    pub optional: Vec<(String, Expr)>,
    pub varargs: Option<String>,
}

/// Precomputed capture layout for a body referenced as an anonymous-function
/// template (Design Note, §9): the parser is expected to have already
/// resolved which enclosing locals are captured and at what context-vector
/// index, so the generator never has to walk enclosing lexical frames.
#[derive(Debug, Clone, Default)]
pub struct CaptureDescriptor {
    pub context_size: u16,
    pub parent_chain: Vec<ContextId>,
    pub captured_slots: Vec<(String, u16)>,
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Params,
    pub body: Vec<Stmt>,
    pub captures: Option<CaptureDescriptor>,
    pub is_constructor: bool,
}

#[derive(Debug, Clone)]
pub struct ObjectDecl {
    pub name: String,
    pub metaclass: String,
    pub superclasses: Vec<String>,
    pub properties: Vec<(String, Expr)>,
}

/// One fragment of a double-quoted string literal that embeds expressions
/// (`"text <<expr>> more text"`, §4.8). A literal with no embeddings is
/// still just `Expr::Str`; this only exists for the embedded form, which is
/// a display statement rather than a value-producing expression.
#[derive(Debug, Clone)]
pub enum StrPart {
    Lit(String),
    Embed(Expr),
}

#[derive(Debug, Clone)]
pub enum Stmt {
    FunctionDecl(FunctionDecl),
    ObjectDecl(ObjectDecl),
    VarDecl { name: String, init: Option<Expr> },
    Expr(Expr),
    /// A bare embedded-expression string literal used as a statement --
    /// TADS 3's implicit-display idiom. Each `StrPart::Lit` run and each
    /// `StrPart::Embed` result is displayed as it is reached, left to
    /// right; there is no concatenated value built on the stack.
    Say(Vec<StrPart>),
    Block(Vec<Stmt>),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    Throw(Expr),
    Try {
        body: Box<Stmt>,
        catch: Option<(String, Box<Stmt>)>,
        finally: Option<Box<Stmt>>,
    },
}

/// The `kind` enumeration `gen_code_asi` dispatches on (§4.7). `Simple` is a
/// plain `=`; the rest name the compound operator so a target that can fuse
/// the whole operation into one instruction (e.g. `ADDILCL1`) may refuse the
/// phased protocol entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOp {
    Simple,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BAnd,
    BOr,
    BXor,
    Shl,
    AShr,
    LShr,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
    Idx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BAnd,
    BOr,
    Xor,
    Shl,
    AShr,
    LShr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// The property named to the right of `.`: either known at compile time or
/// itself an expression to be evaluated (`obj.(expr)`).
#[derive(Debug, Clone)]
pub enum MemberProp {
    Const(String),
    Expr(Box<Expr>),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Int(i32),
    Float(f64),
    Str(String),
    Bool(bool),
    Nil,
    List(Vec<Expr>),
    Ident(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Assign {
        target: Box<Expr>,
        op: CompoundOp,
        value: Option<Box<Expr>>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        named_args: Vec<(String, Expr)>,
    },
    New {
        class: Box<Expr>,
        args: Vec<Expr>,
        named_args: Vec<(String, Expr)>,
        is_transient: bool,
    },
    Member {
        target: Box<Expr>,
        prop: MemberProp,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    /// `inherited<T1,T2>(args)` -- superclass method dispatch. `through`
    /// names the explicit superclass list (empty for plain `inherited`).
    Inherited {
        through: Vec<String>,
        args: Vec<Expr>,
    },
    AnonFunc(Box<FunctionDecl>),
}
