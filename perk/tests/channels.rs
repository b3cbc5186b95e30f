//! Producer/consumer: one fiber sends 0..9999, the main fiber receives all
//! of them in order. Nothing is lost or reordered.

#![cfg(target_arch = "x86_64")]

mod common;

use common::*;
use object::Slot;
use perk::Runtime;

#[test]
fn producer_consumer_sums_in_order() {
    let rt = Runtime::create();
    let module = test_module("__test__");
    let result = result_atom(rt);

    // producer(ch, i) = if i < 10000 { send(ch, i); recur(ch, i + 1) }
    let producer_body = branch(
        apply(
            builtin(rt, "lessthan"),
            vec![local(rt, "i", 2), lit_int(10_000)],
        ),
        do_(vec![
            apply(
                builtin(rt, "send"),
                vec![local(rt, "ch", 1), local(rt, "i", 2)],
            ),
            recur(vec![
                local(rt, "ch", 1),
                apply(builtin(rt, "add"), vec![local(rt, "i", 2), lit_int(1)]),
            ]),
        ]),
        lit_bool(false),
    );
    let producer = function(rt, module, "producer", &["ch", "i"], &[], &[], producer_body);
    let producer_closure = make_closure(rt, producer);

    // consumer(ch, i, sum) = if i < 10000 { recur(ch, i + 1, sum + recv(ch)) }
    //                        else { publish(sum) }
    let consumer_body = branch(
        apply(
            builtin(rt, "lessthan"),
            vec![local(rt, "i", 2), lit_int(10_000)],
        ),
        recur(vec![
            local(rt, "ch", 1),
            apply(builtin(rt, "add"), vec![local(rt, "i", 2), lit_int(1)]),
            apply(
                builtin(rt, "add"),
                vec![
                    local(rt, "sum", 3),
                    apply(builtin(rt, "recv"), vec![local(rt, "ch", 1)]),
                ],
            ),
        ]),
        publish(rt, result, local(rt, "sum", 3)),
    );
    let consumer = function(
        rt,
        module,
        "consumer",
        &["ch", "i", "sum"],
        &[],
        &[],
        consumer_body,
    );
    let consumer_closure = make_closure(rt, consumer);

    // entry(ch) captured by the spawned producer thunk
    let producer_entry = function(
        rt,
        module,
        "producer_entry",
        &[],
        &[],
        &["ch"],
        apply(
            value_node(producer_closure),
            vec![symbol(rt, "ch"), lit_int(0)],
        ),
    );

    // main() = let ch = channel(); spawn(producer_entry); consumer(ch, 0, 0)
    let main_body = do_(vec![
        let_(rt, "ch", apply(builtin(rt, "channel"), vec![])),
        apply(builtin(rt, "spawn"), vec![producer_entry]),
        apply(
            value_node(consumer_closure),
            vec![local(rt, "ch", 1), lit_int(0), lit_int(0)],
        ),
    ]);
    let main = function(rt, module, "main", &[], &["ch"], &[], main_body);

    let code = rt.run_main_closure(make_closure(rt, main));
    assert_eq!(code, 0);
    assert!(matches!(atom_value(result), Slot::Int(49_995_000)));
}
