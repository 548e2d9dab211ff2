//! velac-lex - Lexical analyzer for Vela source code.
//!
//! The lexer turns an in-memory byte buffer into a token stream, one token
//! per call, with a single token of lookahead. Newlines become implicit
//! semicolons after the token kinds that can end a statement, so the parser
//! only ever sees explicit or implicit semicolons.

mod cursor;
mod lexer;
mod token;

pub use cursor::Cursor;
pub use lexer::Lexer;
pub use token::{Tok, Token};
