//! Inline-cache behavior: one call site serving (Int, Int) then
//! (String, String) then (Int, Int) again succeeds every time, and the
//! cached target ends up back on the numeric method after at most one
//! retry.

#![cfg(target_arch = "x86_64")]

mod common;

use common::*;
use perk::builtins::arith;
use perk::Runtime;

#[test]
fn binary_dispatch_follows_argument_types() {
    let rt = Runtime::create();
    let module = test_module("__test__");
    let result = result_atom(rt);

    // f(a, b) = a + b   — the single add call site inside f
    let add_site = apply(
        builtin(rt, "add"),
        vec![local(rt, "a", 1), local(rt, "b", 2)],
    );
    let f = function(rt, module, "f", &["a", "b"], &[], &[], add_site);
    let f_closure = make_closure(rt, f);

    // main() = publish(str(f(1, 2), f("x", "y"), f(3, 4)))
    let main_body = publish(
        rt,
        result,
        apply(
            builtin(rt, "str"),
            vec![
                apply(value_node(f_closure), vec![lit_int(1), lit_int(2)]),
                apply(
                    value_node(f_closure),
                    vec![lit_str(rt, "x"), lit_str(rt, "y")],
                ),
                apply(value_node(f_closure), vec![lit_int(3), lit_int(4)]),
            ],
        ),
    );
    let main = function(rt, module, "main", &[], &[], &[], main_body);

    let initial_target = as_apply(add_site).load_target();

    let code = rt.run_main_closure(make_closure(rt, main));
    assert_eq!(code, 0);
    assert_eq!(str_value(atom_value(result)), "3xy7");

    // the call site's target was re-resolved away from the bootstrap
    // dispatcher, and the final (Int, Int) call left the numeric method
    // installed
    let final_target = as_apply(add_site).load_target();
    assert_ne!(final_target, initial_target);
    assert_eq!(final_target, arith::bi_add_num as usize);
}
