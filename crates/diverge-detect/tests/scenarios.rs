//! End-to-end detection scenarios, driving the public entry point with
//! programs assembled through the syntax builders.

use std::time::Duration;

use diverge_detect::{test_for_infinite_loop, test_for_infinite_loop_with, DetectorConfig, LoopKind};
use diverge_syntax::build::*;
use diverge_syntax::BinOp;

#[test]
fn recursion_without_base_case_is_detected() {
    // function f(n) { return f(n - 1); } f(5);
    let prog = program(vec![
        fn_decl(
            "f",
            vec!["n"],
            vec![ret(Some(call_named(
                "f",
                vec![binary(BinOp::Sub, ident("n"), num(1.0))],
            )))],
        ),
        expr_stmt(call_named("f", vec![num(5.0)])),
    ]);
    let verdict = test_for_infinite_loop(&prog, &[]).expect("verdict");
    assert_eq!(verdict.kind, LoopKind::NoBaseCase);
    assert!(!verdict.stream_mode);
    assert!(verdict.explanation().contains("no base case"));
}

#[test]
fn constant_state_recursion_is_a_cycle() {
    // function f(x) { return x[0] === 1 ? x : f(x); } f([2, 3, 4]);
    let prog = program(vec![
        fn_decl(
            "f",
            vec!["x"],
            vec![ret(Some(cond(
                binary(BinOp::Eq, index(ident("x"), num(0.0)), num(1.0)),
                ident("x"),
                call_named("f", vec![ident("x")]),
            )))],
        ),
        expr_stmt(call_named(
            "f",
            vec![array(vec![num(2.0), num(3.0), num(4.0)])],
        )),
    ]);
    let verdict = test_for_infinite_loop(&prog, &[]).expect("verdict");
    assert_eq!(verdict.kind, LoopKind::Cycle);
    let text = verdict.explanation();
    assert!(text.contains("cycle"), "{}", text);
    assert!(text.contains("[2, 3, 4]"), "{}", text);
}

#[test]
fn double_recursion_without_base_case_is_detected() {
    // function fib(x) { return fib(x - 1) + fib(x - 2); } fib(100000);
    let prog = program(vec![
        fn_decl(
            "fib",
            vec!["x"],
            vec![ret(Some(binary(
                BinOp::Add,
                call_named("fib", vec![binary(BinOp::Sub, ident("x"), num(1.0))]),
                call_named("fib", vec![binary(BinOp::Sub, ident("x"), num(2.0))]),
            )))],
        ),
        expr_stmt(call_named("fib", vec![num(100000.0)])),
    ]);
    let verdict = test_for_infinite_loop(&prog, &[]).expect("verdict");
    assert_eq!(verdict.kind, LoopKind::NoBaseCase);
    assert!(!verdict.stream_mode);
}

#[test]
fn incrementing_recursion_is_proven_by_the_solver() {
    // function f(x) { return x === 0 ? x : f(x + 1); } f(1);
    let prog = program(vec![
        fn_decl(
            "f",
            vec!["x"],
            vec![ret(Some(cond(
                binary(BinOp::Eq, ident("x"), num(0.0)),
                ident("x"),
                call_named("f", vec![binary(BinOp::Add, ident("x"), num(1.0))]),
            )))],
        ),
        expr_stmt(call_named("f", vec![num(1.0)])),
    ]);
    let verdict = test_for_infinite_loop(&prog, &[]).expect("verdict");
    assert_eq!(verdict.kind, LoopKind::FromSmt);
    let text = verdict.explanation();
    assert!(text.contains("never stops"), "{}", text);
}

#[test]
fn forcing_an_unbounded_stream_is_detected() {
    // stream_to_list(integers_from(0));
    let prog = program(vec![expr_stmt(call_named(
        "stream_to_list",
        vec![call_named("integers_from", vec![num(0.0)])],
    ))]);
    let verdict = test_for_infinite_loop(&prog, &[]).expect("verdict");
    assert_eq!(verdict.kind, LoopKind::NoBaseCase);
    assert!(verdict.stream_mode);
    assert!(verdict.explanation().contains("stream"));
}

#[test]
fn infinite_while_loop_is_proven_by_the_solver() {
    // let x = 1; while (x > 0) { x = x + 1; }
    let prog = program(vec![
        let_("x", num(1.0)),
        while_(
            binary(BinOp::Gt, ident("x"), num(0.0)),
            vec![assign("x", binary(BinOp::Add, ident("x"), num(1.0)))],
        ),
    ]);
    let verdict = test_for_infinite_loop(&prog, &[]).expect("verdict");
    assert_eq!(verdict.kind, LoopKind::FromSmt);
}

#[test]
fn empty_update_while_loop_is_a_cycle() {
    // let x = 0; while (x < 5) {}
    let prog = program(vec![
        let_("x", num(0.0)),
        while_(binary(BinOp::Lt, ident("x"), num(5.0)), vec![]),
    ]);
    let verdict = test_for_infinite_loop(&prog, &[]).expect("verdict");
    assert_eq!(verdict.kind, LoopKind::Cycle);
    assert!(verdict
        .explanation()
        .contains("no variables are being updated"));
}

#[test]
fn higher_order_recursion_yields_no_verdict() {
    // function g(f, x) { return g(f, f(x)); } g(y => y, 0);
    // Function-valued arguments suppress the check; the run ends at the
    // depth ceiling, which is not a detection.
    let prog = program(vec![
        fn_decl(
            "g",
            vec!["f", "x"],
            vec![ret(Some(call_named(
                "g",
                vec![ident("f"), call(ident("f"), vec![ident("x")])],
            )))],
        ),
        expr_stmt(call_named(
            "g",
            vec![lambda_expr(vec!["y"], ident("y")), num(0.0)],
        )),
    ]);
    assert!(test_for_infinite_loop(&prog, &[]).is_none());
}

#[test]
fn terminating_recursion_yields_no_verdict() {
    // function fact(n) { if (n < 1) { return 1; } return n * fact(n - 1); }
    let prog = program(vec![
        fn_decl(
            "fact",
            vec!["n"],
            vec![
                if_(
                    binary(BinOp::Lt, ident("n"), num(1.0)),
                    vec![ret(Some(num(1.0)))],
                    vec![],
                ),
                ret(Some(binary(
                    BinOp::Mul,
                    ident("n"),
                    call_named("fact", vec![binary(BinOp::Sub, ident("n"), num(1.0))]),
                ))),
            ],
        ),
        expr_stmt(call_named("fact", vec![num(30.0)])),
    ]);
    assert!(test_for_infinite_loop(&prog, &[]).is_none());
}

#[test]
fn bounded_for_loop_yields_no_verdict() {
    // for (let i = 0; i < 100; i = i + 1) {}
    let prog = program(vec![for_(
        let_("i", num(0.0)),
        binary(BinOp::Lt, ident("i"), num(100.0)),
        assign("i", binary(BinOp::Add, ident("i"), num(1.0))),
        vec![],
    )]);
    assert!(test_for_infinite_loop(&prog, &[]).is_none());
}

#[test]
fn runtime_errors_yield_no_verdict() {
    // Referencing an unbound variable fails the shadow run, which is
    // inconclusive rather than a detection.
    let prog = program(vec![expr_stmt(ident("no_such_variable"))]);
    assert!(test_for_infinite_loop(&prog, &[]).is_none());
}

#[test]
fn zero_timeout_yields_no_verdict() {
    let config = DetectorConfig {
        timeout: Duration::ZERO,
        ..DetectorConfig::default()
    };
    let prog = program(vec![
        let_("x", num(1.0)),
        while_(
            binary(BinOp::Gt, ident("x"), num(0.0)),
            vec![assign("x", binary(BinOp::Add, ident("x"), num(1.0)))],
        ),
    ]);
    assert!(test_for_infinite_loop_with(config, &prog, &[]).is_none());
}

#[test]
fn earlier_programs_stay_callable() {
    // A function defined by a previous snippet diverges when the current
    // snippet finally calls it.
    let earlier = program(vec![fn_decl(
        "spin",
        vec!["n"],
        vec![ret(Some(call_named(
            "spin",
            vec![binary(BinOp::Add, ident("n"), num(1.0))],
        )))],
    )]);
    let current = program(vec![expr_stmt(call_named("spin", vec![num(0.0)]))]);
    let verdict = test_for_infinite_loop(&current, &[earlier]).expect("verdict");
    assert_eq!(verdict.kind, LoopKind::NoBaseCase);
}

#[test]
fn nondeterministic_loops_yield_no_verdict() {
    // while (x > 0) { x = math_random(); } cannot be generalized, so the
    // run spins until the budget expires without a detection.
    let config = DetectorConfig {
        timeout: Duration::from_millis(200),
        ..DetectorConfig::default()
    };
    let prog = program(vec![
        let_("x", num(1.0)),
        while_(
            binary(BinOp::Gt, ident("x"), num(0.0)),
            vec![assign("x", call_named("math_random", vec![]))],
        ),
    ]);
    assert!(test_for_infinite_loop_with(config, &prog, &[]).is_none());
}
