//! Whole-pipeline scenarios (compile + run): build a small DAG, run it,
//! check what comes out the other end.

use std::sync::Arc;

use colgraph::{
    run, BuiltinKind, ColumnType, Compiler, ExecutionError, ExecutorOptions, Operator,
    OperatorError, OperatorInput, OperatorOutput, OperatorPool, OperatorRef, RawDag, Row,
    StaticRegistry,
};
use serde_json::json;

#[derive(Debug)]
struct DoubleA;
impl Operator for DoubleA {
    fn call(&self, input: OperatorInput<'_>) -> Result<OperatorOutput, OperatorError> {
        match input {
            OperatorInput::Row(r) => {
                let a = r.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
                let mut out = Row::new();
                out.insert("c".into(), json!(a * 2));
                Ok(OperatorOutput::Row(out))
            }
            OperatorInput::Window(_) => unreachable!(),
        }
    }
}

fn registry_with(ops: Vec<(&str, Arc<dyn Operator>)>) -> Arc<StaticRegistry> {
    let mut registry = StaticRegistry::new();
    for (name, op) in ops {
        registry.register(name, op);
    }
    Arc::new(registry)
}

fn hub_ref(name: &str) -> OperatorRef {
    OperatorRef::Hub {
        name: name.to_string(),
        init_args: vec![],
        init_kwargs: Default::default(),
        tag: "main".to_string(),
    }
}

#[test]
fn scenario_1_linear_map() {
    let json_text = r#"{
        "_input": {
            "inputs": [], "outputs": ["a", "b"],
            "iter_info": {"type": "nop"},
            "next_nodes": ["op1"]
        },
        "op1": {
            "inputs": ["a"], "outputs": ["c"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "hub", "name": "double_a"},
            "config": {},
            "next_nodes": ["_output"]
        },
        "_output": {
            "inputs": ["b", "c"], "outputs": ["b", "c"],
            "iter_info": {"type": "nop"}
        }
    }"#;
    let plan = Compiler::compile(RawDag::from_json(json_text).unwrap()).unwrap();

    let edge0 = plan.out_edges(plan.input_index)[0];
    let schema0 = &plan.edge(edge0).schema;
    assert_eq!(schema0.iter().find(|e| e.name == "a").unwrap().ty, ColumnType::Scalar);
    assert_eq!(schema0.iter().find(|e| e.name == "b").unwrap().ty, ColumnType::Scalar);
    assert!(plan.terminal_edge.column("c").is_some());
    assert_eq!(plan.terminal_edge.column("c").unwrap().ty, ColumnType::Scalar);

    let registry = registry_with(vec![("double_a", Arc::new(DoubleA))]);
    let pool = Arc::new(OperatorPool::new());
    let input = vec![{
        let mut r = Row::new();
        r.insert("a".into(), json!(3));
        r.insert("b".into(), json!("x"));
        r
    }];

    let rows = run(plan, registry, pool, ExecutorOptions::default(), input).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("c"), Some(&json!(6)));
}

#[derive(Debug)]
struct SplitA;
impl Operator for SplitA {
    fn call(&self, input: OperatorInput<'_>) -> Result<OperatorOutput, OperatorError> {
        match input {
            OperatorInput::Row(r) => {
                let a = r.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
                let rows = (0..a)
                    .map(|i| {
                        let mut out = r.clone();
                        out.insert("a".into(), json!(i));
                        out
                    })
                    .collect();
                Ok(OperatorOutput::Rows(rows))
            }
            OperatorInput::Window(_) => unreachable!(),
        }
    }
}

#[derive(Debug)]
struct KeepEven;
impl Operator for KeepEven {
    fn call(&self, input: OperatorInput<'_>) -> Result<OperatorOutput, OperatorError> {
        match input {
            OperatorInput::Row(r) => {
                let a = r.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(OperatorOutput::Bool(a % 2 == 0))
            }
            OperatorInput::Window(_) => unreachable!(),
        }
    }
}

#[test]
fn scenario_2_flat_map_promotes_to_queue() {
    let json_text = r#"{
        "_input": {
            "inputs": [], "outputs": ["a", "b"],
            "iter_info": {"type": "nop"},
            "next_nodes": ["op1"]
        },
        "op1": {
            "inputs": ["a"], "outputs": ["a"],
            "iter_info": {"type": "flat_map"},
            "op_info": {"type": "hub", "name": "split_a"},
            "config": {},
            "next_nodes": ["op2"]
        },
        "op2": {
            "inputs": ["a", "b"], "outputs": ["a"],
            "iter_info": {"type": "filter"},
            "op_info": {"type": "hub", "name": "keep_even"},
            "config": {},
            "next_nodes": ["_output"]
        },
        "_output": {
            "inputs": ["a"], "outputs": ["a"],
            "iter_info": {"type": "nop"}
        }
    }"#;
    let plan = Compiler::compile(RawDag::from_json(json_text).unwrap()).unwrap();

    let op1_idx = plan.find_node("op1").unwrap();
    let op1_out = plan.out_edges(op1_idx)[0];
    let schema = &plan.edge(op1_out).schema;
    assert_eq!(schema.iter().find(|e| e.name == "a").unwrap().ty, ColumnType::Queue);
    assert_eq!(schema.iter().find(|e| e.name == "b").unwrap().ty, ColumnType::Scalar);

    let registry = registry_with(vec![
        ("split_a", Arc::new(SplitA) as Arc<dyn Operator>),
        ("keep_even", Arc::new(KeepEven)),
    ]);
    let pool = Arc::new(OperatorPool::new());
    let input = vec![{
        let mut r = Row::new();
        r.insert("a".into(), json!(4));
        r.insert("b".into(), json!("y"));
        r
    }];

    let rows = run(plan, registry, pool, ExecutorOptions::default(), input).unwrap();
    let mut values: Vec<i64> = rows.iter().filter_map(|r| r.get("a").and_then(|v| v.as_i64())).collect();
    values.sort();
    assert_eq!(values, vec![0, 2]);
}

#[test]
fn scenario_3_fan_out_fan_in_both_paths_survive() {
    let json_text = r#"{
        "_input": {
            "inputs": [], "outputs": ["a"],
            "iter_info": {"type": "nop"},
            "next_nodes": ["op1"]
        },
        "op1": {
            "inputs": ["a"], "outputs": ["a"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "builtin", "name": "nop"},
            "config": {},
            "next_nodes": ["op2", "add_node"]
        },
        "op2": {
            "inputs": ["a"], "outputs": ["a", "b"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "hub", "name": "add_b"},
            "config": {},
            "next_nodes": ["_output"]
        },
        "add_node": {
            "inputs": ["a"], "outputs": ["a", "c"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "hub", "name": "add_c"},
            "config": {},
            "next_nodes": ["_output"]
        },
        "_output": {
            "inputs": ["a", "b", "c"], "outputs": ["a", "b", "c"],
            "iter_info": {"type": "nop"}
        }
    }"#;
    let plan = Compiler::compile(RawDag::from_json(json_text).unwrap()).unwrap();
    assert_eq!(plan.graph.edge_count(), 5);
    assert_eq!(plan.in_edges(plan.output_index).len(), 2);

    #[derive(Debug)]
    struct AddB;
    impl Operator for AddB {
        fn call(&self, input: OperatorInput<'_>) -> Result<OperatorOutput, OperatorError> {
            match input {
                OperatorInput::Row(r) => {
                    let mut out = r.clone();
                    out.insert("b".into(), json!("left"));
                    Ok(OperatorOutput::Row(out))
                }
                OperatorInput::Window(_) => unreachable!(),
            }
        }
    }
    #[derive(Debug)]
    struct AddC;
    impl Operator for AddC {
        fn call(&self, input: OperatorInput<'_>) -> Result<OperatorOutput, OperatorError> {
            match input {
                OperatorInput::Row(r) => {
                    let mut out = r.clone();
                    out.insert("c".into(), json!("right"));
                    Ok(OperatorOutput::Row(out))
                }
                OperatorInput::Window(_) => unreachable!(),
            }
        }
    }

    let registry = registry_with(vec![
        ("add_b", Arc::new(AddB) as Arc<dyn Operator>),
        ("add_c", Arc::new(AddC)),
    ]);
    let pool = Arc::new(OperatorPool::new());
    let input = vec![{
        let mut r = Row::new();
        r.insert("a".into(), json!(1));
        r
    }];

    let rows = run(plan, registry, pool, ExecutorOptions::default(), input).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|r| r.get("b") == Some(&json!("left"))));
    assert!(rows.iter().any(|r| r.get("c") == Some(&json!("right"))));
}

#[test]
fn scenario_4_undeclared_column_is_rejected() {
    let json_text = r#"{
        "_input": {
            "inputs": [], "outputs": ["a"],
            "iter_info": {"type": "nop"},
            "next_nodes": ["op1"]
        },
        "op1": {
            "inputs": ["x", "y"], "outputs": ["a"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "builtin", "name": "nop"},
            "config": {},
            "next_nodes": ["_output"]
        },
        "_output": {
            "inputs": ["a"], "outputs": ["a"],
            "iter_info": {"type": "nop"}
        }
    }"#;
    let err = Compiler::compile(RawDag::from_json(json_text).unwrap()).unwrap_err();
    match err {
        ExecutionError::UndeclaredColumns { node, columns } => {
            assert_eq!(node, "op1");
            assert!(columns.contains("x"));
            assert!(columns.contains("y"));
        }
        other => panic!("expected UndeclaredColumns, got {other:?}"),
    }
}

#[test]
fn scenario_5_missing_sink_is_rejected() {
    let json_text = r#"{
        "_input": {
            "inputs": [], "outputs": ["a"],
            "iter_info": {"type": "nop"},
            "next_nodes": ["op1"]
        },
        "op1": {
            "inputs": ["a"], "outputs": ["a"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "builtin", "name": "nop"},
            "config": {},
            "next_nodes": []
        }
    }"#;
    let err = Compiler::compile(RawDag::from_json(json_text).unwrap()).unwrap_err();
    assert!(matches!(err, ExecutionError::NoValidSourceOrSink));
}

#[test]
fn scenario_6_cycle_is_rejected() {
    let json_text = r#"{
        "_input": {
            "inputs": [], "outputs": ["a"],
            "iter_info": {"type": "nop"},
            "next_nodes": ["op1"]
        },
        "op1": {
            "inputs": ["a"], "outputs": ["a"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "builtin", "name": "nop"},
            "config": {},
            "next_nodes": ["op2"]
        },
        "op2": {
            "inputs": ["a"], "outputs": ["a"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "builtin", "name": "nop"},
            "config": {},
            "next_nodes": ["op1", "_output"]
        },
        "_output": {
            "inputs": ["a"], "outputs": ["a"],
            "iter_info": {"type": "nop"}
        }
    }"#;
    let err = Compiler::compile(RawDag::from_json(json_text).unwrap()).unwrap_err();
    assert!(matches!(err, ExecutionError::Cycle(_)));
}

#[test]
fn scenario_7_diamond_count_accumulation() {
    // _input -> op1 -> {left, right} -> merge -> _output. Column `a` is
    // re-emitted by both `op1` and `left`, so its count climbs by one each
    // time: 1 on the entry edge, 2 out of `op1` (both branches), 3 out of
    // `left` (which re-emits it again), steady at 2 out of `right` (which
    // only passes it through), and back up to 3 once `merge` re-emits it
    // on the way to `_output`.
    let json_text = r#"{
        "_input": {
            "inputs": [], "outputs": ["a", "b"],
            "iter_info": {"type": "nop"},
            "next_nodes": ["op1"]
        },
        "op1": {
            "inputs": ["a"], "outputs": ["a", "c"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "builtin", "name": "nop"},
            "config": {},
            "next_nodes": ["left", "right"]
        },
        "left": {
            "inputs": ["a", "b"], "outputs": ["a", "d"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "builtin", "name": "nop"},
            "config": {},
            "next_nodes": ["merge"]
        },
        "right": {
            "inputs": ["c"], "outputs": ["c", "e"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "builtin", "name": "nop"},
            "config": {},
            "next_nodes": ["merge"]
        },
        "merge": {
            "inputs": ["d", "e"], "outputs": ["d", "e"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "builtin", "name": "nop"},
            "config": {},
            "next_nodes": ["_output"]
        },
        "_output": {
            "inputs": ["a", "d", "e"], "outputs": ["a", "d", "e"],
            "iter_info": {"type": "nop"}
        }
    }"#;
    let plan = Compiler::compile(RawDag::from_json(json_text).unwrap()).unwrap();

    let entry_count = plan
        .edge(plan.out_edges(plan.input_index)[0])
        .column("a")
        .unwrap()
        .count;
    assert_eq!(entry_count, 1);

    let op1_idx = plan.find_node("op1").unwrap();
    for &edge in plan.out_edges(op1_idx) {
        assert_eq!(plan.edge(edge).column("a").unwrap().count, 2);
    }

    let left_idx = plan.find_node("left").unwrap();
    let left_out_count = plan.edge(plan.out_edges(left_idx)[0]).column("a").unwrap().count;
    assert_eq!(left_out_count, 3);

    let right_idx = plan.find_node("right").unwrap();
    let right_out_count = plan.edge(plan.out_edges(right_idx)[0]).column("a").unwrap().count;
    assert_eq!(right_out_count, 2);

    assert_eq!(plan.terminal_edge.column("a").unwrap().count, 3);
}

#[test]
fn unknown_builtin_operator_name_is_rejected_at_compile_time() {
    let json_text = r#"{
        "_input": {
            "inputs": [], "outputs": ["a"],
            "iter_info": {"type": "nop"},
            "next_nodes": ["op1"]
        },
        "op1": {
            "inputs": ["a"], "outputs": ["a"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "builtin", "name": "nonsense"},
            "config": {},
            "next_nodes": ["_output"]
        },
        "_output": {
            "inputs": ["a"], "outputs": ["a"],
            "iter_info": {"type": "nop"}
        }
    }"#;
    let err = Compiler::compile(RawDag::from_json(json_text).unwrap()).unwrap_err();
    assert!(matches!(err, ExecutionError::UnknownOperatorKind(_)));
}

#[test]
fn operator_failure_is_reported_as_a_single_aggregate_error() {
    #[derive(Debug)]
    struct AlwaysFails;
    impl Operator for AlwaysFails {
        fn call(&self, _input: OperatorInput<'_>) -> Result<OperatorOutput, OperatorError> {
            Err("boom".into())
        }
    }

    let json_text = r#"{
        "_input": {
            "inputs": [], "outputs": ["a"],
            "iter_info": {"type": "nop"},
            "next_nodes": ["op1"]
        },
        "op1": {
            "inputs": ["a"], "outputs": ["a"],
            "iter_info": {"type": "map"},
            "op_info": {"type": "hub", "name": "always_fails"},
            "config": {},
            "next_nodes": ["_output"]
        },
        "_output": {
            "inputs": ["a"], "outputs": ["a"],
            "iter_info": {"type": "nop"}
        }
    }"#;
    let plan = Compiler::compile(RawDag::from_json(json_text).unwrap()).unwrap();
    let registry = registry_with(vec![("always_fails", Arc::new(AlwaysFails))]);
    let pool = Arc::new(OperatorPool::new());
    let input = vec![{
        let mut r = Row::new();
        r.insert("a".into(), json!(1));
        r
    }];

    let err = run(plan, registry, pool, ExecutorOptions::default(), input).unwrap_err();
    assert!(matches!(err, ExecutionError::Aggregate(1, _)));
}

#[test]
fn builtin_concat_operator_ref_resolves_without_a_registry() {
    let plan_ref = hub_ref("unused");
    // a Hub ref needs a registry entry; Builtin never consults one.
    let pool = OperatorPool::new();
    let registry = StaticRegistry::new();
    assert!(pool
        .get_or_init(&OperatorRef::Builtin(BuiltinKind::Nop), &registry)
        .is_ok());
    assert!(pool.get_or_init(&plan_ref, &registry).is_err());
}
