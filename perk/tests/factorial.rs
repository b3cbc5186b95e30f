//! Tail recursion through `recur`: a million iterations reuse one frame and
//! the value stack never grows past its 64 KiB bound.

#![cfg(target_arch = "x86_64")]

mod common;

use common::*;
use object::Slot;
use perk::Runtime;

#[test]
fn factorial_via_tail_recursion() {
    let rt = Runtime::create();
    let module = test_module("__test__");
    let result = result_atom(rt);

    // fac(n, acc) = if n == 0 { acc } else { recur(n - 1, n * acc) }
    let fac_body = branch(
        apply(builtin(rt, "equals"), vec![local(rt, "n", 1), lit_int(0)]),
        local(rt, "acc", 2),
        recur(vec![
            apply(builtin(rt, "subtract"), vec![local(rt, "n", 1), lit_int(1)]),
            apply(
                builtin(rt, "multiply"),
                vec![local(rt, "n", 1), local(rt, "acc", 2)],
            ),
        ]),
    );
    let fac = function(rt, module, "fac", &["n", "acc"], &[], &[], fac_body);
    let fac_closure = make_closure(rt, fac);

    let main_body = publish(
        rt,
        result,
        apply(value_node(fac_closure), vec![lit_int(1_000_000), lit_int(1)]),
    );
    let main = function(rt, module, "main", &[], &[], &[], main_body);

    let code = rt.run_main_closure(make_closure(rt, main));
    assert_eq!(code, 0);
    // 1_000_000! carries far more than 64 factors of two, so the wrapping
    // product is 0 modulo 2^64
    assert!(matches!(atom_value(result), Slot::Int(0)));
}
