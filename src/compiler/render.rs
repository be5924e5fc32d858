//! Query tree to SQL text.
//!
//! Rendering is a single walk over the clauses into a [`TokenStream`].
//! Parameters are collected in the same walk, so placeholder `n` always
//! binds `params[n - 1]`.

use std::collections::BTreeSet;

use super::ast::{
    Clause, ColumnRef, Join, Operand, OrderItem, OrderTarget, Param, Predicate, QueryAst,
    SelectItem,
};
use super::{CompilationError, CompilationResult};
use crate::query::{Arity, FilterOp, SortDirection};
use crate::sql::{Dialect, SqlDialect, Token, TokenStream};

/// Rendered SQL with its parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSql {
    pub sql: String,
    pub params: Vec<Param>,
}

/// The set of dialects a deployment renders for.
#[derive(Debug, Clone)]
pub struct RendererRegistry {
    dialects: BTreeSet<Dialect>,
}

impl Default for RendererRegistry {
    fn default() -> Self {
        Self::new(Dialect::ALL)
    }
}

impl RendererRegistry {
    pub fn new(dialects: impl IntoIterator<Item = Dialect>) -> Self {
        Self {
            dialects: dialects.into_iter().collect(),
        }
    }

    pub fn supports(&self, dialect: Dialect) -> bool {
        self.dialects.contains(&dialect)
    }

    pub fn render(&self, ast: &QueryAst, dialect: Dialect) -> CompilationResult<RenderedSql> {
        if !self.supports(dialect) {
            return Err(CompilationError::UnsupportedDialect(dialect.to_string()));
        }
        render(ast, dialect)
    }

    /// Render for a dialect given by name.
    pub fn render_named(&self, ast: &QueryAst, dialect: &str) -> CompilationResult<RenderedSql> {
        let dialect: Dialect = dialect
            .parse()
            .map_err(|_| CompilationError::UnsupportedDialect(dialect.to_string()))?;
        self.render(ast, dialect)
    }
}

/// Render `ast` for `dialect`, without the registry check.
pub fn render(ast: &QueryAst, dialect: Dialect) -> CompilationResult<RenderedSql> {
    let mut renderer = Renderer {
        dialect,
        params: Vec::new(),
    };
    let tokens = renderer.query(ast)?;
    Ok(RenderedSql {
        sql: tokens.serialize(dialect),
        params: renderer.params,
    })
}

struct Renderer {
    dialect: Dialect,
    params: Vec<Param>,
}

impl Renderer {
    fn query(&mut self, ast: &QueryAst) -> CompilationResult<TokenStream> {
        let mut ts = TokenStream::new();
        let has_order_by = !ast.order_by().is_empty();

        for clause in &ast.clauses {
            match clause {
                Clause::Select(items) => {
                    ts.push(Token::Select);
                    for (i, item) in items.iter().enumerate() {
                        if i == 0 {
                            ts.newline().indent(1);
                        } else {
                            ts.comma().newline().indent(1);
                        }
                        ts.append(&select_item(item));
                    }
                }
                Clause::From(table) => {
                    ts.newline()
                        .push(Token::From)
                        .space()
                        .push(Token::Ident(table.clone()));
                }
                Clause::Join(join) => {
                    ts.newline().append(&join_tokens(join));
                }
                Clause::Filter(predicate) => {
                    if predicate.leaf_count() > 0 {
                        ts.newline().push(Token::Where).space();
                        let where_clause = self.predicate(predicate, true)?;
                        ts.append(&where_clause);
                    }
                }
                Clause::GroupBy(columns) => {
                    ts.newline().push(Token::GroupBy).space();
                    for (i, column) in columns.iter().enumerate() {
                        if i > 0 {
                            ts.comma().space();
                        }
                        ts.push(column_token(column));
                    }
                }
                Clause::OrderBy(items) => {
                    ts.newline().push(Token::OrderBy).space();
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            ts.comma().space();
                        }
                        ts.append(&order_item(item));
                    }
                }
                Clause::Limit(limit) => {
                    // OFFSET FETCH needs an ORDER BY; fall back to the first
                    // selected column.
                    if self.dialect.requires_order_by_for_limit() && !has_order_by {
                        if let Some(first) = ast.select_items().first() {
                            ts.newline()
                                .push(Token::OrderBy)
                                .space()
                                .push(Token::Ident(first.alias().to_string()));
                        }
                    }
                    ts.newline().append(&self.dialect.emit_limit(*limit));
                }
            }
        }

        Ok(ts)
    }

    fn bind(&mut self, param: &Param) -> Token {
        self.params.push(param.clone());
        Token::Placeholder(self.params.len())
    }

    fn predicate(&mut self, predicate: &Predicate, top: bool) -> CompilationResult<TokenStream> {
        let mut ts = TokenStream::new();
        match predicate {
            Predicate::And(items) | Predicate::Or(items) => {
                let (joiner, nested) = match predicate {
                    Predicate::Or(_) => (Token::Or, true),
                    _ => (Token::And, !top),
                };
                let items: Vec<&Predicate> = items.iter().filter(|p| p.leaf_count() > 0).collect();
                if nested && items.len() > 1 {
                    ts.lparen();
                }
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        if nested {
                            ts.space();
                        } else {
                            ts.newline().indent(1);
                        }
                        ts.push(joiner.clone()).space();
                    }
                    let inner = self.predicate(item, false)?;
                    ts.append(&inner);
                }
                if nested && items.len() > 1 {
                    ts.rparen();
                }
            }
            Predicate::Comparison {
                column,
                op,
                operand,
            } => {
                ts.push(column_token(column)).space();
                self.comparison(&mut ts, column, *op, operand)?;
            }
        }
        Ok(ts)
    }

    fn comparison(
        &mut self,
        ts: &mut TokenStream,
        column: &ColumnRef,
        op: FilterOp,
        operand: &Operand,
    ) -> CompilationResult<()> {
        match (op, operand) {
            (FilterOp::In | FilterOp::NotIn, Operand::List(values)) if !values.is_empty() => {
                if op == FilterOp::NotIn {
                    ts.push(Token::Not).space();
                }
                ts.push(Token::In).space().lparen();
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        ts.comma().space();
                    }
                    let placeholder = self.bind(value);
                    ts.push(placeholder);
                }
                ts.rparen();
            }
            (FilterOp::Between, Operand::Range(low, high)) => {
                let low = self.bind(low);
                let high = self.bind(high);
                ts.push(Token::Between)
                    .space()
                    .push(low)
                    .space()
                    .push(Token::And)
                    .space()
                    .push(high);
            }
            (op, Operand::Single(value)) if op.arity() == Arity::One => {
                let placeholder = self.bind(value);
                ts.push(comparison_operator(op)).space().push(placeholder);
            }
            (op, _) => {
                return Err(CompilationError::MalformedPredicate {
                    column: column.column.clone(),
                    operator: op,
                })
            }
        }
        Ok(())
    }
}

fn comparison_operator(op: FilterOp) -> Token {
    match op {
        FilterOp::Ne => Token::Ne,
        FilterOp::Gt => Token::Gt,
        FilterOp::Lt => Token::Lt,
        FilterOp::Gte => Token::Gte,
        FilterOp::Lte => Token::Lte,
        _ => Token::Eq,
    }
}

fn column_token(column: &ColumnRef) -> Token {
    Token::QualifiedIdent {
        qualifier: Some(column.table.clone()),
        name: column.column.clone(),
    }
}

fn select_item(item: &SelectItem) -> TokenStream {
    let mut ts = TokenStream::new();
    match item {
        SelectItem::Column { column, alias } => {
            ts.push(column_token(column));
            ts.space().push(Token::As).space().push(Token::Ident(alias.clone()));
        }
        SelectItem::Aggregate(agg) => {
            ts.push(Token::FunctionName(agg.function.function_name())).lparen();
            if agg.function.is_distinct() {
                ts.push(Token::Distinct).space();
            }
            ts.push(column_token(&agg.column)).rparen();
            ts.space()
                .push(Token::As)
                .space()
                .push(Token::Ident(agg.alias.clone()));
        }
    }
    ts
}

fn join_tokens(join: &Join) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.push(Token::Left)
        .space()
        .push(Token::Join)
        .space()
        .push(Token::Ident(join.table.clone()))
        .space()
        .push(Token::On)
        .space()
        .push(column_token(&join.on_fact))
        .space()
        .push(Token::Eq)
        .space()
        .push(column_token(&join.on_dimension));
    ts
}

fn order_item(item: &OrderItem) -> TokenStream {
    let mut ts = TokenStream::new();
    match &item.target {
        OrderTarget::Alias(alias) => ts.push(Token::Ident(alias.clone())),
        OrderTarget::Column(column) => ts.push(column_token(column)),
    };
    ts.space().push(match item.direction {
        SortDirection::Asc => Token::Asc,
        SortDirection::Desc => Token::Desc,
    });
    ts
}
