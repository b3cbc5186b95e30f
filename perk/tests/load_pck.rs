//! End-to-end over the external interface: serialize a module in the `.pck`
//! wire format, load it through the module loader, and run its `main`.

#![cfg(target_arch = "x86_64")]

mod common;

use perk::pack::{PackValue, PackWriter};
use perk::Runtime;

fn node(kind: &str, entries: Vec<(&str, PackValue)>) -> PackValue {
    let mut map = vec![(PackValue::str("type"), PackValue::str(kind))];
    for (key, value) in entries {
        map.push((PackValue::str(key), value));
    }
    PackValue::Map(map)
}

fn int_lit(value: i64) -> PackValue {
    node("integer", vec![("value", PackValue::Str(value.to_string()))])
}

#[test]
fn loads_and_runs_a_packed_module() {
    // main() = print(add(20, 22))
    let call_add = node(
        "call",
        vec![
            ("line", PackValue::Int(2)),
            ("expr", node("builtin", vec![("value", PackValue::str("add"))])),
            ("args", PackValue::Array(vec![int_lit(20), int_lit(22)])),
        ],
    );
    let call_print = node(
        "call",
        vec![
            ("line", PackValue::Int(2)),
            (
                "expr",
                node("builtin", vec![("value", PackValue::str("print"))]),
            ),
            ("args", PackValue::Array(vec![call_add])),
        ],
    );
    let main_fn = node(
        "function",
        vec![
            ("name", PackValue::str("main")),
            ("line", PackValue::Int(1)),
            ("parms", PackValue::Array(vec![])),
            ("locals", PackValue::Array(vec![])),
            ("freevars", PackValue::Array(vec![])),
            ("stmts", PackValue::Array(vec![call_print])),
        ],
    );
    let module = node(
        "module",
        vec![(
            "stmts",
            PackValue::Array(vec![node(
                "define",
                vec![("name", PackValue::str("main")), ("expr", main_fn)],
            )]),
        )],
    );

    let mut writer = PackWriter::new();
    writer.write_value(&module);
    let bytes = writer.into_bytes();

    let dir = std::env::temp_dir().join(format!("perk-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");
    let pck = dir.join("program.pck");
    std::fs::write(&pck, &bytes).expect("write pck");

    let rt = Runtime::create();
    let code = rt.run(pck.to_str().expect("utf-8 path"));
    assert_eq!(code, 0);

    let _ = std::fs::remove_dir_all(&dir);
}
