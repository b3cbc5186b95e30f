//! Deferred closures run last-in first-out before the caller observes the
//! return.

#![cfg(target_arch = "x86_64")]

mod common;

use common::*;
use perk::Runtime;

#[test]
fn defers_apply_in_lifo_order() {
    let rt = Runtime::create();
    let module = test_module("__test__");
    let trace = result_atom(rt);
    let result = result_atom(rt);

    // append(tag): compare_and_set(trace, deref(trace), deref(trace) + tag)
    // with an undefined-to-string bootstrap on the first append
    let append = |tag: &str| {
        let current = || apply(builtin(rt, "deref"), vec![value_node(trace)]);
        // str(deref(trace)) yields "undefined" initially; seed with ""
        // instead by publishing the first tag over undefined
        function(
            rt,
            module,
            &format!("append_{tag}"),
            &[],
            &[],
            &[],
            branch(
                apply(
                    builtin(rt, "equals"),
                    vec![current(), lit_undef()],
                ),
                apply(
                    builtin(rt, "compare_and_set"),
                    vec![value_node(trace), lit_undef(), lit_str(rt, tag)],
                ),
                apply(
                    builtin(rt, "compare_and_set"),
                    vec![
                        value_node(trace),
                        current(),
                        apply(builtin(rt, "add"), vec![current(), lit_str(rt, tag)]),
                    ],
                ),
            ),
        )
    };

    // f() = defer(A); defer(B); defer(C); 0
    let f_body = do_(vec![
        apply(builtin(rt, "defer"), vec![append("A")]),
        apply(builtin(rt, "defer"), vec![append("B")]),
        apply(builtin(rt, "defer"), vec![append("C")]),
        lit_int(0),
    ]);
    let f = function(rt, module, "f", &[], &[], &[], f_body);
    let f_closure = make_closure(rt, f);

    // main() = f(); publish(deref(trace))
    // by the time f's call returns, all three defers have run
    let main_body = do_(vec![
        apply(value_node(f_closure), vec![]),
        publish(
            rt,
            result,
            apply(builtin(rt, "deref"), vec![value_node(trace)]),
        ),
    ]);
    let main = function(rt, module, "main", &[], &[], &[], main_body);

    let code = rt.run_main_closure(make_closure(rt, main));
    assert_eq!(code, 0);
    assert_eq!(str_value(atom_value(result)), "CBA");
    assert_eq!(str_value(atom_value(trace)), "CBA");
}
