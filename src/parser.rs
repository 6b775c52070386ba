//! Recursive-descent parser.
//!
//! Consumes the token stream produced by [`crate::lexer`] and builds a
//! `Program` AST rooted in the node store. Operator precedence matches C;
//! vector-aware operators are spelled the same as their scalar forms, so
//! the grammar itself is shape-agnostic. The first syntax error aborts
//! parsing; there is no recovery.

use crate::ast::{Ast, BinaryOp, LitValue, NodeId, NodeKind, Param, UnaryOp, VarDeclEntry};
use crate::error::{Error, Result};
use crate::lang;
use crate::lexer::{Token, TokenKind};
use crate::types::TypeInfo;

/// Parses a whole translation unit into `ast`, returning the program
/// root. `tokens` must end with `Eof`.
pub fn parse_program<'s>(ast: &mut Ast<'s>, tokens: &[Token<'s>]) -> Result<NodeId> {
    let mut parser = Parser { ast, tokens, pos: 0 };
    parser.program()
}

struct Parser<'a, 's> {
    ast: &'a mut Ast<'s>,
    tokens: &'a [Token<'s>],
    pos: usize,
}

impl<'a, 's> Parser<'a, 's> {
    fn peek(&self) -> &Token<'s> {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind<'s> {
        self.peek().kind
    }

    fn peek_kind_at(&self, ahead: usize) -> TokenKind<'s> {
        self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)].kind
    }

    fn here(&self) -> u32 {
        self.peek().pos
    }

    fn advance(&mut self) -> Token<'s> {
        let tok = self.tokens[self.pos];
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: TokenKind<'s>) -> bool {
        if self.peek_kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind<'s>) -> Result<Token<'s>> {
        if self.peek_kind() == kind {
            Ok(self.advance())
        } else {
            Err(self.err())
        }
    }

    fn err(&self) -> Error {
        Error::InvalidSyntax { position: self.here() }
    }

    /// Type keyword at the cursor, if any.
    fn peek_type(&self) -> Option<TypeInfo> {
        match self.peek_kind() {
            TokenKind::Ident(name) => lang::type_by_name(name),
            _ => None,
        }
    }

    fn expect_ident(&mut self) -> Result<(&'s str, u32)> {
        match self.peek_kind() {
            TokenKind::Ident(name) => {
                let pos = self.here();
                self.advance();
                Ok((name, pos))
            }
            _ => Err(self.err()),
        }
    }

    fn program(&mut self) -> Result<NodeId> {
        let pos = self.here();
        let mut decls = Vec::new();
        while self.peek_kind() != TokenKind::Eof {
            decls.push(self.top_level_decl()?);
        }
        let root = self.ast.add(NodeKind::Program { decls }, pos);
        self.ast.root = root;
        Ok(root)
    }

    /// Top-level: function definitions and `const` variable declarations.
    fn top_level_decl(&mut self) -> Result<NodeId> {
        if self.peek_kind() == TokenKind::KwConst {
            let decl = self.var_decl()?;
            self.expect(TokenKind::Semi)?;
            return Ok(decl);
        }
        let pos = self.here();
        let ret = self.peek_type().ok_or_else(|| self.err())?;
        // A function when `type ident (` follows; a declaration otherwise.
        if matches!(self.peek_kind_at(1), TokenKind::Ident(_))
            && self.peek_kind_at(2) == TokenKind::LParen
        {
            self.advance();
            let (name, _) = self.expect_ident()?;
            let params = self.param_list()?;
            let body = self.block()?;
            return Ok(self
                .ast
                .add(NodeKind::Function { name, ret, params, body }, pos));
        }
        let decl = self.var_decl()?;
        self.expect(TokenKind::Semi)?;
        Ok(decl)
    }

    fn param_list(&mut self) -> Result<Vec<Param<'s>>> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.eat(TokenKind::RParen) {
            loop {
                let ty = self.peek_type().ok_or_else(|| self.err())?;
                self.advance();
                let (name, pos) = self.expect_ident()?;
                params.push(Param { name, ty, pos, var: u32::MAX });
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
        }
        Ok(params)
    }

    fn block(&mut self) -> Result<NodeId> {
        let pos = self.here();
        self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.eat(TokenKind::RBrace) {
            if self.peek_kind() == TokenKind::Eof {
                return Err(self.err());
            }
            stmts.push(self.statement()?);
        }
        Ok(self.ast.add(NodeKind::Block { stmts }, pos))
    }

    fn statement(&mut self) -> Result<NodeId> {
        let pos = self.here();
        match self.peek_kind() {
            TokenKind::LBrace => self.block(),
            TokenKind::KwIf => self.if_statement(),
            TokenKind::KwFor => self.for_statement(),
            TokenKind::KwWhile => self.while_statement(),
            TokenKind::KwDo => self.do_while_statement(),
            TokenKind::KwBreak => {
                self.advance();
                self.expect(TokenKind::Semi)?;
                Ok(self.ast.add(NodeKind::Break, pos))
            }
            TokenKind::KwContinue => {
                self.advance();
                self.expect(TokenKind::Semi)?;
                Ok(self.ast.add(NodeKind::Continue, pos))
            }
            TokenKind::KwReturn => {
                self.advance();
                let value = if self.peek_kind() == TokenKind::Semi {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(TokenKind::Semi)?;
                Ok(self.ast.add(NodeKind::Return { value }, pos))
            }
            _ if self.at_var_decl() => {
                let decl = self.var_decl()?;
                self.expect(TokenKind::Semi)?;
                Ok(decl)
            }
            _ => {
                let expr = self.expression()?;
                self.expect(TokenKind::Semi)?;
                Ok(self.ast.add(NodeKind::ExprStmt { expr }, pos))
            }
        }
    }

    /// `const`, or a type keyword followed by an identifier, opens a
    /// variable declaration. A lone type keyword opens a constructor
    /// expression instead (`float4(…)`).
    fn at_var_decl(&self) -> bool {
        if self.peek_kind() == TokenKind::KwConst {
            return true;
        }
        self.peek_type().is_some() && matches!(self.peek_kind_at(1), TokenKind::Ident(_))
    }

    fn var_decl(&mut self) -> Result<NodeId> {
        let pos = self.here();
        let is_const = self.eat(TokenKind::KwConst);
        let ty = self.peek_type().ok_or_else(|| self.err())?;
        if ty.is_void() {
            return Err(self.err());
        }
        self.advance();
        let mut decls = Vec::new();
        loop {
            let (name, name_pos) = self.expect_ident()?;
            let init = if self.eat(TokenKind::Assign) {
                Some(self.assignment()?)
            } else {
                None
            };
            decls.push(VarDeclEntry { name, ty, init, pos: name_pos, var: u32::MAX });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        Ok(self.ast.add(NodeKind::VarDecl { is_const, decls }, pos))
    }

    fn if_statement(&mut self) -> Result<NodeId> {
        let pos = self.here();
        self.advance();
        self.expect(TokenKind::LParen)?;
        let cond = self.expression()?;
        self.expect(TokenKind::RParen)?;
        let then_stmt = self.statement()?;
        let else_stmt = if self.eat(TokenKind::KwElse) {
            Some(self.statement()?)
        } else {
            None
        };
        Ok(self
            .ast
            .add(NodeKind::If { cond, then_stmt, else_stmt }, pos))
    }

    fn for_statement(&mut self) -> Result<NodeId> {
        let pos = self.here();
        self.advance();
        self.expect(TokenKind::LParen)?;
        let init = if self.eat(TokenKind::Semi) {
            None
        } else if self.at_var_decl() {
            let decl = self.var_decl()?;
            self.expect(TokenKind::Semi)?;
            Some(decl)
        } else {
            let expr = self.expression()?;
            self.expect(TokenKind::Semi)?;
            let stmt_pos = self.ast.pos(expr);
            Some(self.ast.add(NodeKind::ExprStmt { expr }, stmt_pos))
        };
        let cond = if self.peek_kind() == TokenKind::Semi {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(TokenKind::Semi)?;
        let step = if self.peek_kind() == TokenKind::RParen {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(TokenKind::RParen)?;
        let body = self.statement()?;
        Ok(self.ast.add(NodeKind::For { init, cond, step, body }, pos))
    }

    fn while_statement(&mut self) -> Result<NodeId> {
        let pos = self.here();
        self.advance();
        self.expect(TokenKind::LParen)?;
        let cond = self.expression()?;
        self.expect(TokenKind::RParen)?;
        let body = self.statement()?;
        Ok(self.ast.add(NodeKind::While { cond, body }, pos))
    }

    fn do_while_statement(&mut self) -> Result<NodeId> {
        let pos = self.here();
        self.advance();
        let body = self.statement()?;
        self.expect(TokenKind::KwWhile)?;
        self.expect(TokenKind::LParen)?;
        let cond = self.expression()?;
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Semi)?;
        Ok(self.ast.add(NodeKind::DoWhile { body, cond }, pos))
    }

    fn expression(&mut self) -> Result<NodeId> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<NodeId> {
        let lhs = self.ternary()?;
        let op = match self.peek_kind() {
            TokenKind::Assign => BinaryOp::Assign,
            TokenKind::PlusAssign => BinaryOp::AddAssign,
            TokenKind::MinusAssign => BinaryOp::SubAssign,
            TokenKind::StarAssign => BinaryOp::MulAssign,
            TokenKind::SlashAssign => BinaryOp::DivAssign,
            TokenKind::PercentAssign => BinaryOp::RemAssign,
            TokenKind::AmpAssign => BinaryOp::AndAssign,
            TokenKind::PipeAssign => BinaryOp::OrAssign,
            TokenKind::CaretAssign => BinaryOp::XorAssign,
            TokenKind::ShlAssign => BinaryOp::ShlAssign,
            TokenKind::ShrAssign => BinaryOp::ShrAssign,
            _ => return Ok(lhs),
        };
        let pos = self.here();
        self.advance();
        let rhs = self.assignment()?;
        Ok(self.ast.add(NodeKind::Binary { op, lhs, rhs }, pos))
    }

    fn ternary(&mut self) -> Result<NodeId> {
        let cond = self.binary(0)?;
        if !self.eat(TokenKind::Question) {
            return Ok(cond);
        }
        let pos = self.ast.pos(cond);
        let then_expr = self.assignment()?;
        self.expect(TokenKind::Colon)?;
        let else_expr = self.assignment()?;
        Ok(self
            .ast
            .add(NodeKind::Ternary { cond, then_expr, else_expr }, pos))
    }

    fn binary_op(kind: TokenKind<'s>) -> Option<(BinaryOp, u8)> {
        Some(match kind {
            TokenKind::OrOr => (BinaryOp::LogOr, 1),
            TokenKind::AndAnd => (BinaryOp::LogAnd, 2),
            TokenKind::Pipe => (BinaryOp::BitOr, 3),
            TokenKind::Caret => (BinaryOp::BitXor, 4),
            TokenKind::Amp => (BinaryOp::BitAnd, 5),
            TokenKind::EqEq => (BinaryOp::Eq, 6),
            TokenKind::NotEq => (BinaryOp::Ne, 6),
            TokenKind::Lt => (BinaryOp::Lt, 7),
            TokenKind::LtEq => (BinaryOp::Le, 7),
            TokenKind::Gt => (BinaryOp::Gt, 7),
            TokenKind::GtEq => (BinaryOp::Ge, 7),
            TokenKind::Shl => (BinaryOp::Shl, 8),
            TokenKind::Shr => (BinaryOp::Shr, 8),
            TokenKind::Plus => (BinaryOp::Add, 9),
            TokenKind::Minus => (BinaryOp::Sub, 9),
            TokenKind::Star => (BinaryOp::Mul, 10),
            TokenKind::Slash => (BinaryOp::Div, 10),
            TokenKind::Percent => (BinaryOp::Rem, 10),
            _ => return None,
        })
    }

    fn binary(&mut self, min_prec: u8) -> Result<NodeId> {
        let mut lhs = self.unary()?;
        while let Some((op, prec)) = Self::binary_op(self.peek_kind()) {
            if prec < min_prec {
                break;
            }
            let pos = self.here();
            self.advance();
            let rhs = self.binary(prec + 1)?;
            lhs = self.ast.add(NodeKind::Binary { op, lhs, rhs }, pos);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<NodeId> {
        let pos = self.here();
        let op = match self.peek_kind() {
            TokenKind::Plus => UnaryOp::Plus,
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Tilde => UnaryOp::BitNot,
            TokenKind::PlusPlus => UnaryOp::PreInc,
            TokenKind::MinusMinus => UnaryOp::PreDec,
            _ => return self.postfix(),
        };
        self.advance();
        let expr = self.unary()?;
        Ok(self.ast.add(NodeKind::Unary { op, expr }, pos))
    }

    fn postfix(&mut self) -> Result<NodeId> {
        let mut expr = self.primary()?;
        loop {
            match self.peek_kind() {
                TokenKind::Dot => {
                    let pos = self.here();
                    self.advance();
                    let (name, _) = self.expect_ident()?;
                    expr = self.ast.add(NodeKind::Member { base: expr, name }, pos);
                }
                TokenKind::LBracket => {
                    let pos = self.here();
                    self.advance();
                    let index = self.expression()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = self.ast.add(NodeKind::Index { base: expr, index }, pos);
                }
                TokenKind::PlusPlus => {
                    let pos = self.here();
                    self.advance();
                    expr = self
                        .ast
                        .add(NodeKind::Unary { op: UnaryOp::PostInc, expr }, pos);
                }
                TokenKind::MinusMinus => {
                    let pos = self.here();
                    self.advance();
                    expr = self
                        .ast
                        .add(NodeKind::Unary { op: UnaryOp::PostDec, expr }, pos);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<NodeId> {
        let pos = self.here();
        match self.peek_kind() {
            TokenKind::Int(v) => {
                self.advance();
                Ok(self
                    .ast
                    .add(NodeKind::Literal { value: LitValue::Int(v) }, pos))
            }
            TokenKind::Float(v) => {
                self.advance();
                Ok(self
                    .ast
                    .add(NodeKind::Literal { value: LitValue::Float(v) }, pos))
            }
            TokenKind::Str(v) => {
                self.advance();
                Ok(self
                    .ast
                    .add(NodeKind::Literal { value: LitValue::Str(v) }, pos))
            }
            TokenKind::Ident("true") => {
                self.advance();
                Ok(self
                    .ast
                    .add(NodeKind::Literal { value: LitValue::Bool(true) }, pos))
            }
            TokenKind::Ident("false") => {
                self.advance();
                Ok(self
                    .ast
                    .add(NodeKind::Literal { value: LitValue::Bool(false) }, pos))
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.peek_kind() == TokenKind::LParen {
                    let args = self.call_args()?;
                    Ok(self.ast.add(NodeKind::Call { name, args }, pos))
                } else {
                    Ok(self.ast.add(NodeKind::Ident { name }, pos))
                }
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            _ => Err(self.err()),
        }
    }

    fn call_args(&mut self) -> Result<Vec<NodeId>> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if self.eat(TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.assignment()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::session::CompilationSession;
    use bumpalo::Bump;

    fn parse(src: &str) -> (Ast<'static>, Result<NodeId>) {
        let arena = Box::leak(Box::new(Bump::new()));
        let session = Box::leak(Box::new(CompilationSession::new(arena)));
        let tokens = tokenize(session, src).unwrap();
        let mut ast = Ast::new();
        let root = parse_program(&mut ast, &tokens);
        (ast, root)
    }

    fn parse_ok(src: &str) -> Ast<'static> {
        let (ast, root) = parse(src);
        root.unwrap();
        ast
    }

    #[test]
    fn function_with_expression() {
        let ast = parse_ok("float main() { return 1.0 + 2.0 * 3.0; }");
        let dump = ast.dump();
        assert!(dump.contains("Function main() -> float"));
        // Multiplication binds tighter than addition.
        assert!(dump.contains("Binary[+]\n          Literal 1.0"));
        assert!(dump.contains("Binary[*]"));
    }

    #[test]
    fn constructor_call_and_swizzle_member() {
        let ast = parse_ok("float4 main() { return float4(1,2,3,4).wzyx; }");
        let dump = ast.dump();
        assert!(dump.contains("Member .wzyx"));
        assert!(dump.contains("Call float4"));
    }

    #[test]
    fn for_loop_with_decl_and_index() {
        let ast = parse_ok(
            "float main() { float s = 0; for (int i = 0; i < 4; i++) s += v[i]; return s; }",
        );
        let dump = ast.dump();
        assert!(dump.contains("For\n"));
        assert!(dump.contains("VarDecl"));
        assert!(dump.contains("Index"));
        assert!(dump.contains("Binary[+=]"));
        assert!(dump.contains("Unary[++]"));
    }

    #[test]
    fn if_else_and_comparisons() {
        let ast = parse_ok("int main() { if (x > 0) return 1; else return -1; }");
        let dump = ast.dump();
        assert!(dump.contains("If\n"));
        assert!(dump.contains("Binary[>]"));
        assert!(dump.contains("Unary[-]"));
    }

    #[test]
    fn ternary_and_logical() {
        let ast = parse_ok("int main() { return a && b || c ? 1 : 0; }");
        let dump = ast.dump();
        assert!(dump.contains("Ternary"));
        assert!(dump.contains("Binary[||]"));
        assert!(dump.contains("Binary[&&]"));
    }

    #[test]
    fn do_while_and_control() {
        let ast = parse_ok(
            "int main() { int i = 0; do { i++; if (i > 3) break; else continue; } while (true); return i; }",
        );
        let dump = ast.dump();
        assert!(dump.contains("DoWhile"));
        assert!(dump.contains("Break"));
        assert!(dump.contains("Continue"));
    }

    #[test]
    fn multi_declarator_and_const() {
        let ast = parse_ok("const float K = 2.0; float main() { float a = K, b; return a; }");
        let dump = ast.dump();
        assert!(dump.contains("VarDecl const"));
        assert!(dump.contains("float b"));
    }

    #[test]
    fn string_literal_parses() {
        let ast = parse_ok("float main() { float x = \"oops\"; return x; }");
        assert!(ast.dump().contains("Literal \"oops\""));
    }

    #[test]
    fn syntax_error_positions() {
        let (_, root) = parse("float main( { return 1; }");
        assert!(matches!(root, Err(Error::InvalidSyntax { .. })));

        let (_, root) = parse("float main() { return 1 + ; }");
        match root {
            Err(Error::InvalidSyntax { position }) => assert_eq!(position, 26),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn user_function_definitions() {
        let ast = parse_ok(
            "float square(float x) { return x * x; } float main() { return square(3.0); }",
        );
        let dump = ast.dump();
        assert!(dump.contains("Function square(float x) -> float"));
        assert!(dump.contains("Call square"));
    }
}
