//! Statements.

use velac_gen::{GotosKind, Register};
use velac_lex::Tok;
use velac_sem::{IdentKind, TypeKind};
use velac_util::CompileResult;

use crate::compiler::Compiler;
use crate::expr::ExprAttrs;

impl Compiler {
    pub(crate) fn parse_stmt(&mut self) -> CompileResult<()> {
        self.sync_debug();
        match self.lex.tok.kind {
            Tok::LBrace => self.parse_nested_block(),
            Tok::If => self.parse_if_stmt(),
            Tok::Switch => self.parse_switch_stmt(),
            Tok::For => self.parse_for_stmt(),
            Tok::Break => self.parse_break_stmt(),
            Tok::Continue => self.parse_continue_stmt(),
            Tok::Return => self.parse_return_stmt(),
            Tok::Type => self.parse_type_decl(),
            Tok::Const => self.parse_const_decl(),
            Tok::Var => self.parse_var_decl(),
            Tok::Semicolon | Tok::ImplicitSemicolon => self.next(),
            _ => {
                self.parse_simple_stmt()?;
                self.eat(Tok::Semicolon)
            }
        }
    }

    /// A nested `{ ... }` statement opens a fresh scope.
    fn parse_nested_block(&mut self) -> CompileResult<()> {
        self.blocks.enter(None);
        let block = self.blocks.current();
        self.parse_block_stmts()?;
        let has_return = self.blocks.top_mut().has_return;
        self.leave_block_scope(block);
        self.blocks.leave();
        if has_return {
            self.blocks.top_mut().has_return = true;
        }
        self.eat(Tok::Semicolon)
    }

    // --- if

    fn parse_if_stmt(&mut self) -> CompileResult<()> {
        self.parse_if_inner()?;
        self.eat(Tok::Semicolon)
    }

    fn parse_if_inner(&mut self) -> CompileResult<()> {
        self.next()?;
        let cond = self.parse_expr()?;
        if self.type_kind(cond.type_id) != TypeKind::Bool {
            return Err(self.error("Boolean expected as condition"));
        }
        self.gen.if_cond_epilog();

        self.blocks.enter(None);
        let block = self.blocks.current();
        self.parse_block_stmts()?;
        let then_returns = self.blocks.top_mut().has_return;
        self.leave_block_scope(block);
        self.blocks.leave();

        let mut else_returns = false;
        if self.check(Tok::Else) {
            self.next()?;
            self.gen.else_prolog();
            if self.check(Tok::If) {
                self.parse_if_inner()?;
                else_returns = false;
            } else {
                self.blocks.enter(None);
                let block = self.blocks.current();
                self.parse_block_stmts()?;
                else_returns = self.blocks.top_mut().has_return;
                self.leave_block_scope(block);
                self.blocks.leave();
            }
            self.gen.if_else_epilog();
        } else {
            self.gen.if_epilog();
        }
        if then_returns && else_returns {
            self.blocks.top_mut().has_return = true;
        }
        Ok(())
    }

    // --- switch

    fn parse_switch_stmt(&mut self) -> CompileResult<()> {
        self.next()?;
        let selector = self.parse_expr()?;
        let selector_type = selector.type_id;
        let kind = self.type_kind(selector_type);
        if !(kind.is_ordinal() || kind == TypeKind::Str) {
            return Err(self.error("Ordinal or string expected as switch selector"));
        }
        self.gen.switch_cond_epilog();

        self.eat(Tok::LBrace)?;
        let mut num_cases = 0usize;
        while self.check(Tok::Case) {
            self.next()?;
            let mut num_constants = 0usize;
            loop {
                let (const_type, konst) = self.parse_const_expr()?;
                self.assert_compatible(selector_type, const_type)?;
                self.gen.push_reg(Register::SwitchExpr);
                self.push_const_value(&konst)?;
                self.gen.case_constant_check(kind, selector_type);
                num_constants += 1;
                if !self.check(Tok::Comma) {
                    break;
                }
                self.next()?;
            }
            self.eat(Tok::Colon)?;
            self.gen.case_block_prolog(num_constants);

            self.blocks.enter(None);
            let block = self.blocks.current();
            while !matches!(self.lex.tok.kind, Tok::Case | Tok::Default | Tok::RBrace) {
                self.parse_stmt()?;
            }
            self.leave_block_scope(block);
            self.blocks.leave();

            self.gen.case_block_epilog();
            num_cases += 1;
        }
        if self.check(Tok::Default) {
            self.next()?;
            self.eat(Tok::Colon)?;
            self.blocks.enter(None);
            let block = self.blocks.current();
            while !self.check(Tok::RBrace) {
                self.parse_stmt()?;
            }
            self.leave_block_scope(block);
            self.blocks.leave();
        }
        self.eat(Tok::RBrace)?;
        self.gen.switch_epilog(num_cases);
        self.eat(Tok::Semicolon)
    }

    // --- for

    /// `for [init ;] cond [; post] { body }`
    fn parse_for_stmt(&mut self) -> CompileResult<()> {
        self.next()?;
        self.blocks.enter(None);
        let loop_block = self.blocks.current();

        // Optional init statement, recognized by its trailing semicolon.
        let has_init = {
            let mut lookahead = self.lex.clone();
            let mut depth = 0i32;
            loop {
                match lookahead.tok.kind {
                    Tok::Semicolon | Tok::ImplicitSemicolon if depth == 0 => break true,
                    Tok::LBrace if depth == 0 => break false,
                    Tok::LPar | Tok::LBracket => depth += 1,
                    Tok::RPar | Tok::RBracket => depth -= 1,
                    Tok::Eof => break false,
                    _ => {}
                }
                lookahead.next(&mut self.interner)?;
            }
        };
        if has_init {
            self.parse_simple_stmt()?;
            self.eat(Tok::Semicolon)?;
        }

        self.gen.for_cond_prolog();
        let cond = self.parse_expr()?;
        if self.type_kind(cond.type_id) != TypeKind::Bool {
            return Err(self.error("Boolean expected as condition"));
        }
        self.gen.for_cond_epilog();

        let post_start = self.gen.ip();
        if self.check(Tok::Semicolon) {
            self.next()?;
            if !self.check(Tok::LBrace) {
                self.parse_simple_stmt()?;
            }
        }
        self.gen.for_post_stmt_epilog();

        self.gen.gotos_prolog(GotosKind::Break, loop_block);
        self.gen.gotos_prolog(GotosKind::Continue, loop_block);

        self.blocks.enter(None);
        let body_block = self.blocks.current();
        self.parse_block_stmts()?;
        self.leave_block_scope(body_block);
        self.blocks.leave();

        // `continue` re-runs the post-statement.
        self.gen.gotos_epilog_to(GotosKind::Continue, post_start);
        self.gen.for_epilog();
        self.gen.gotos_epilog(GotosKind::Break);

        self.leave_block_scope(loop_block);
        self.blocks.leave();
        self.eat(Tok::Semicolon)
    }

    // --- break / continue / return

    fn parse_break_stmt(&mut self) -> CompileResult<()> {
        self.next()?;
        let Some(target_block) = self.gen.gotos_block(GotosKind::Break) else {
            return Err(self.error("No loop to break"));
        };
        self.release_down_to_block(target_block);
        self.gen.gotos_add_stub(GotosKind::Break);
        self.eat(Tok::Semicolon)
    }

    fn parse_continue_stmt(&mut self) -> CompileResult<()> {
        self.next()?;
        let Some(target_block) = self.gen.gotos_block(GotosKind::Continue) else {
            return Err(self.error("No loop to continue"));
        };
        self.release_down_to_block(target_block);
        self.gen.gotos_add_stub(GotosKind::Continue);
        self.eat(Tok::Semicolon)
    }

    fn parse_return_stmt(&mut self) -> CompileResult<()> {
        self.next()?;
        let fn_ident = self
            .blocks
            .fn_block()
            .and_then(|b| b.fn_ident)
            .ok_or_else(|| self.error("Return outside a function"))?;
        let fn_type = self.idents.get(fn_ident).type_id;
        let sig = self.types.get(fn_type).sig.clone().expect("function has a signature");
        let result_kind = self.type_kind(sig.result);

        if result_kind != TypeKind::Void {
            let attrs = self.parse_expr()?;
            let attrs = self.implicit_conv(sig.result, attrs)?;
            self.assert_compatible(sig.result, attrs.type_id)?;

            if result_kind.is_structured() {
                // Copy into the caller's temporary through the hidden
                // result pointer.
                let result_param_index = sig.params.len() - 1;
                let offset = velac_sem::Idents::param_offset(&self.types, &sig, result_param_index)
                    .map_err(|msg| self.error(msg))?;
                self.gen.push_local(TypeKind::Ptr, offset);
                self.gen.swap();
                let size = self.type_size(sig.result)?;
                let op = if attrs.owned { Tok::MinusMinus } else { Tok::PlusPlus };
                self.gen.change_ref_cnt_assign(op, sig.result, size);
                self.gen.push_local(TypeKind::Ptr, offset);
                self.gen.pop_reg(Register::Result);
            } else {
                if self.type_kind(sig.result).is_garbage_collected() && !attrs.owned {
                    self.gen.change_ref_cnt(Tok::PlusPlus, sig.result);
                }
                self.gen.pop_reg(Register::Result);
            }
        }

        let Some(target_block) = self.gen.gotos_block(GotosKind::Return) else {
            return Err(self.error("Return outside a function"));
        };
        self.release_down_to_block(target_block);
        self.gen.gotos_add_stub(GotosKind::Return);
        self.blocks.top_mut().has_return = true;
        if let Some(fn_block) = self.blocks.fn_block_mut() {
            fn_block.has_return = true;
        }
        self.eat(Tok::Semicolon)
    }

    // --- simple statements

    /// Assignment, short declaration, compound assignment, increment,
    /// decrement, or a call.
    pub(crate) fn parse_simple_stmt(&mut self) -> CompileResult<()> {
        // `x := e` declares; everything else starts with a designator.
        if self.lex.tok.kind == Tok::Ident {
            let mut lookahead = self.lex.clone();
            lookahead.next(&mut self.interner)?;
            if lookahead.check(Tok::ColonEq) {
                return self.parse_short_var_decl();
            }
        }

        let attrs = self.parse_designator()?;
        match self.lex.tok.kind {
            Tok::Eq => {
                self.next()?;
                if !attrs.is_var {
                    return Err(self.error("Assignment target is not a variable"));
                }
                let lhs_type = attrs.type_id;
                let rhs = self.parse_expr()?;
                self.store_through_ptr(lhs_type, rhs)
            }
            op if op.short_assignment_op().is_some() => {
                self.next()?;
                if !attrs.is_var {
                    return Err(self.error("Assignment target is not a variable"));
                }
                self.parse_compound_assignment(attrs, op.short_assignment_op().expect("checked"))
            }
            Tok::PlusPlus | Tok::MinusMinus => {
                let op = self.lex.tok.kind;
                self.next()?;
                if !attrs.is_var {
                    return Err(self.error("Increment target is not a variable"));
                }
                let kind = self.type_kind(attrs.type_id);
                if !kind.is_integer() {
                    return Err(self.error("Integer expected"));
                }
                self.gen.unary(op, kind);
                Ok(())
            }
            _ => self.finish_expr_stmt(attrs),
        }
    }

    /// `x op= e` compiles as `x = x op e` with the address evaluated once.
    fn parse_compound_assignment(&mut self, attrs: ExprAttrs, op: Tok) -> CompileResult<()> {
        let lhs_type = attrs.type_id;
        let kind = self.type_kind(lhs_type);
        self.assert_valid_operator(lhs_type, op)?;

        // [addr] -> [addr, addr] -> [addr, value]
        self.gen.dup();
        self.gen.deref(kind);
        let rhs = self.parse_expr()?;
        let rhs = if kind.is_real() && self.type_kind(rhs.type_id).is_integer() {
            self.gen
                .call_builtin(velac_sem::BuiltinFn::Real, self.type_kind(rhs.type_id), None);
            ExprAttrs::value(lhs_type)
        } else {
            rhs
        };
        self.assert_compatible(lhs_type, rhs.type_id)?;
        self.gen.binary(op, kind, lhs_type);

        let size = self.type_size(lhs_type)?;
        if kind.is_garbage_collected() {
            // The freshly computed value owns its reference (string
            // concatenation allocates), so no further acquisition.
            let owned_op = if kind == TypeKind::Str { Tok::MinusMinus } else { Tok::PlusPlus };
            self.gen.change_ref_cnt_assign(owned_op, lhs_type, size);
        } else {
            self.gen.assign(kind, size);
        }
        Ok(())
    }

    /// `x := e`: declare and initialize in the current scope.
    fn parse_short_var_decl(&mut self) -> CompileResult<()> {
        let line = self.lex.tok.line;
        let name = self.eat_ident()?;
        self.eat(Tok::ColonEq)?;

        // The type comes from the initializer; compile it once into a
        // temporary flow: evaluate, then declare, then store.
        // Evaluation first would leave the value below the destination
        // pointer, so the destination is pushed after a swap.
        let attrs = self.parse_expr()?;
        let type_id = attrs.type_id;
        if self.type_kind(type_id) == TypeKind::Void {
            return Err(self.error("Expression has no value"));
        }
        let index = self.declare_var(name, type_id, false, line)?;
        match self.idents.get(index).kind {
            IdentKind::LocalVar { offset } => self.gen.push_local_ptr(offset),
            IdentKind::GlobalVar { offset } => self.gen.push_global_ptr(offset),
            _ => unreachable!("declare_var declares variables"),
        }
        self.gen.swap();
        self.store_through_ptr(type_id, attrs)
    }

    /// An expression in statement position: a call (result discarded) or
    /// an error for anything valueless.
    fn finish_expr_stmt(&mut self, attrs: ExprAttrs) -> CompileResult<()> {
        let kind = self.type_kind(attrs.type_id);
        if kind == TypeKind::Void {
            return Ok(());
        }
        // A discarded owned result still has references to drop: park it
        // in a temporary so the block epilog releases it.
        if attrs.owned && kind.is_garbage_collected() {
            let temp = self.alloc_temp(attrs.type_id)?;
            let offset = self.local_offset(temp);
            self.gen.push_local_ptr(offset);
            self.gen.swap();
            let size = self.type_size(attrs.type_id)?;
            self.gen.change_ref_cnt_assign(Tok::MinusMinus, attrs.type_id, size);
            return Ok(());
        }
        // Scalar and structured values alike occupy one slot on the
        // operand stack (structured ones are represented by a pointer).
        self.gen.pop(1);
        Ok(())
    }
}
