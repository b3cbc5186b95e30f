//! Sleep-based fairness: 100 fibers each sleep then send their index; the
//! main fiber collects all 100 values.

#![cfg(target_arch = "x86_64")]

mod common;

use common::*;
use object::Slot;
use perk::Runtime;

#[test]
fn hundred_sleepers_all_report() {
    let rt = Runtime::create();
    let module = test_module("__test__");
    let result = result_atom(rt);

    // worker: sleep(10); send(done, i)   [done, i are freevars]
    let worker_entry = function(
        rt,
        module,
        "worker",
        &[],
        &[],
        &["done", "i"],
        do_(vec![
            apply(builtin(rt, "sleep"), vec![lit_int(10)]),
            apply(
                builtin(rt, "send"),
                vec![symbol(rt, "done"), symbol(rt, "i")],
            ),
        ]),
    );

    // spawner(done, i) = if i < 100 { spawn(worker); recur(done, i + 1) }
    let spawner_body = branch(
        apply(
            builtin(rt, "lessthan"),
            vec![local(rt, "i", 2), lit_int(100)],
        ),
        do_(vec![
            apply(builtin(rt, "spawn"), vec![worker_entry]),
            recur(vec![
                local(rt, "done", 1),
                apply(builtin(rt, "add"), vec![local(rt, "i", 2), lit_int(1)]),
            ]),
        ]),
        lit_bool(false),
    );
    let spawner = function(rt, module, "spawner", &["done", "i"], &[], &[], spawner_body);
    let spawner_closure = make_closure(rt, spawner);

    // collect(done, i, sum) = if i < 100 { recur(done, i+1, sum + recv(done)) }
    //                         else { publish(sum) }
    let collect_body = branch(
        apply(
            builtin(rt, "lessthan"),
            vec![local(rt, "i", 2), lit_int(100)],
        ),
        recur(vec![
            local(rt, "done", 1),
            apply(builtin(rt, "add"), vec![local(rt, "i", 2), lit_int(1)]),
            apply(
                builtin(rt, "add"),
                vec![
                    local(rt, "sum", 3),
                    apply(builtin(rt, "recv"), vec![local(rt, "done", 1)]),
                ],
            ),
        ]),
        publish(rt, result, local(rt, "sum", 3)),
    );
    let collect = function(
        rt,
        module,
        "collect",
        &["done", "i", "sum"],
        &[],
        &[],
        collect_body,
    );
    let collect_closure = make_closure(rt, collect);

    // main() = let done = channel(); spawner(done, 0); collect(done, 0, 0)
    let main_body = do_(vec![
        let_(rt, "done", apply(builtin(rt, "channel"), vec![])),
        apply(
            value_node(spawner_closure),
            vec![local(rt, "done", 1), lit_int(0)],
        ),
        apply(
            value_node(collect_closure),
            vec![local(rt, "done", 1), lit_int(0), lit_int(0)],
        ),
    ]);
    let main = function(rt, module, "main", &[], &["done"], &[], main_body);

    let code = rt.run_main_closure(make_closure(rt, main));
    assert_eq!(code, 0);
    // every index 0..99 arrived exactly once
    assert!(matches!(atom_value(result), Slot::Int(4950)));
}
