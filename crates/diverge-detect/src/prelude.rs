//! The stream prelude, expressed as an ordinary program in the surface
//! language.
//!
//! Streams are lazily-produced lists: a pair whose tail is a nullary
//! function producing the rest. Defining the helpers in the language
//! itself, rather than as builtins, means every stream force runs through
//! the instrumented evaluator, so the lazy-pair predicate checks inside
//! them feed the stream-mode heuristic.

use diverge_syntax::build::*;
use diverge_syntax::{BinOp, Program};

/// `stream_tail`, `integers_from`, and `stream_to_list`, evaluated before
/// any user program.
pub fn stream_prelude() -> Program {
    program(vec![
        // stream_tail(xs): force the tail thunk.
        fn_decl(
            "stream_tail",
            vec!["xs"],
            vec![if_(
                call_named("is_pair", vec![ident("xs")]),
                vec![ret(Some(call(
                    call_named("tail", vec![ident("xs")]),
                    vec![],
                )))],
                vec![expr_stmt(call_named(
                    "error",
                    vec![string("stream_tail expects a pair")],
                ))],
            )],
        ),
        // integers_from(n): the unbounded ascending stream.
        fn_decl(
            "integers_from",
            vec!["n"],
            vec![ret(Some(call_named(
                "pair",
                vec![
                    ident("n"),
                    lambda_expr(
                        vec![],
                        call_named("integers_from", vec![binary(BinOp::Add, ident("n"), num(1.0))]),
                    ),
                ],
            )))],
        ),
        // stream_to_list(xs): force the whole stream into an eager list.
        fn_decl(
            "stream_to_list",
            vec!["xs"],
            vec![if_(
                call_named("is_null", vec![ident("xs")]),
                vec![ret(Some(null()))],
                vec![ret(Some(call_named(
                    "pair",
                    vec![
                        call_named("head", vec![ident("xs")]),
                        call_named(
                            "stream_to_list",
                            vec![call_named("stream_tail", vec![ident("xs")])],
                        ),
                    ],
                )))],
            )],
        ),
    ])
}
