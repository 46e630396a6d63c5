use crate::ast::{Env, Expr};
use crate::error::{Error, MultiError};
use crate::evaluator::{EvalOptions, Evaluator};
use crate::operator::{Operator, Phase, Registry, Response};
use crate::parser::{parse_arguments, split_opcall};
use crate::path::Path;
use crate::static_ips::{expand_range, StaticRange};
use crate::tree::Value;
use crate::yaml::from_yaml_str;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

// ── Shared fixture runners ──────────────────────────────────────────

/// Embed fixture files at compile time.
const EVAL_FIXTURES: &str = include_str!("../test-data/fixtures/eval.json");
const STATIC_IPS_FIXTURES: &str = include_str!("../test-data/fixtures/static-ips.json");

fn doc(src: &str) -> Value {
    from_yaml_str(src).unwrap()
}

fn run_fixtures(text: &str) {
    let fixtures: Vec<serde_json::Value> = serde_json::from_str(text).unwrap();

    for fixture in &fixtures {
        let name = fixture["name"].as_str().unwrap();
        let inputs: Vec<&str> = match &fixture["input"] {
            serde_json::Value::String(s) => vec![s.as_str()],
            serde_json::Value::Array(items) => {
                items.iter().map(|item| item.as_str().unwrap()).collect()
            }
            other => panic!("Fixture '{}': unsupported input {:?}", name, other),
        };
        let expect_errors = fixture
            .get("expectErrors")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let result = crate::merge_yaml(&inputs, EvalOptions::default());

        if expect_errors {
            assert!(
                !result.errors.is_empty(),
                "Fixture '{}': expected errors but got none",
                name
            );
            if let Some(code) = fixture.get("errorCode").and_then(|v| v.as_str()) {
                let codes: Vec<&str> = result.errors.errors.iter().map(Error::code).collect();
                assert!(
                    codes.contains(&code),
                    "Fixture '{}': expected error code {}, got {:?}",
                    name,
                    code,
                    codes
                );
            }
            continue;
        }

        assert!(
            result.errors.is_empty(),
            "Fixture '{}': unexpected errors: {}",
            name,
            result.errors
        );
        let expected = doc(fixture["expected"].as_str().unwrap());
        assert_eq!(result.value, expected, "Fixture '{}'", name);
    }
}

#[test]
fn test_fixture_eval() {
    run_fixtures(EVAL_FIXTURES);
}

#[test]
fn test_fixture_static_ips() {
    run_fixtures(STATIC_IPS_FIXTURES);
}

fn flow(src: &str, phase: Phase) -> Result<Vec<String>, MultiError> {
    let mut ev = Evaluator::new(doc(src));
    let ops = ev.data_flow(phase)?;
    Ok(ops.iter().map(|op| op.location().to_string()).collect())
}

fn run(src: &str, options: EvalOptions) -> (Value, Result<(), MultiError>) {
    let mut ev = Evaluator::new(doc(src)).with_options(options);
    let result = ev.run();
    (ev.into_tree(), result)
}

fn fixed_env(pairs: &[(&str, &str)]) -> Env {
    Env::Fixed(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    )
}

fn reference(path: &str) -> Expr {
    Expr::Reference(Path::parse(path).unwrap())
}

fn literal(v: impl Into<Value>) -> Expr {
    Expr::Literal(v.into())
}

// ── Operator call syntax ────────────────────────────────────────────

#[test]
fn test_split_opcall_forms() {
    let (name, args) = split_opcall("(( grab a.b ))").unwrap();
    assert_eq!(name, "grab");
    assert_eq!(args.trim(), "a.b");

    let (name, args) = split_opcall("((grab(a.b)))").unwrap();
    assert_eq!(name, "grab");
    assert_eq!(args, "a.b");

    let (name, args) = split_opcall("(( prune ))").unwrap();
    assert_eq!(name, "prune");
    assert_eq!(args.trim(), "");

    let (name, _) = split_opcall("(( cartesian-product a b ))").unwrap();
    assert_eq!(name, "cartesian-product");
}

#[test]
fn test_split_opcall_rejects_plain_strings() {
    for src in ["plain", "(( ))", "(( 9lives ))", "(grab a)", "(( grab a )) tail"] {
        assert!(split_opcall(src).is_none(), "{} should not be a call", src);
    }
}

#[test]
fn test_arguments_classification() {
    let args = parse_arguments(r#"meta.a || "x", $HOME 3 4.5 nil TRUE"#).unwrap();
    assert_eq!(
        args.exprs,
        vec![
            Expr::Or(Box::new(reference("meta.a")), Box::new(literal("x"))),
            Expr::EnvVar("HOME".to_string()),
            literal(3i64),
            Expr::Literal(Value::Float(4.5)),
            Expr::Literal(Value::Null),
            literal(true),
        ]
    );
    assert!(args.warnings.is_empty());
}

#[test]
fn test_arguments_quoting_and_escapes() {
    let args = parse_arguments(r#""a\"b" "tab\there" "c, d" e,f"#).unwrap();
    assert_eq!(
        args.exprs,
        vec![
            literal("a\"b"),
            literal("tab\there"),
            literal("c, d"),
            reference("e"),
            reference("f"),
        ]
    );
}

#[test]
fn test_arguments_numbers() {
    let args = parse_arguments("-2 +7 .5 1.0").unwrap();
    assert_eq!(
        args.exprs,
        vec![
            literal(-2i64),
            literal(7i64),
            Expr::Literal(Value::Float(0.5)),
            Expr::Literal(Value::Float(1.0)),
        ]
    );
}

#[test]
fn test_arguments_or_chains_nest_right() {
    let args = parse_arguments("a || b || c, d || e").unwrap();
    assert_eq!(
        args.exprs,
        vec![
            Expr::Or(
                Box::new(reference("a")),
                Box::new(Expr::Or(Box::new(reference("b")), Box::new(reference("c")))),
            ),
            Expr::Or(Box::new(reference("d")), Box::new(reference("e"))),
        ]
    );
}

#[test]
fn test_short_circuit_inside_right_nested_chain() {
    let args = parse_arguments("a || \"x\" || b").unwrap();
    assert_eq!(
        args.exprs,
        vec![Expr::Or(Box::new(reference("a")), Box::new(literal("x")))]
    );
    assert_eq!(args.warnings.len(), 1);
}

#[test]
fn test_arguments_syntax_errors() {
    for src in ["|| a", "a || || b", "a ||", "a ||, b", "[oops", "$"] {
        let err = parse_arguments(src).unwrap_err();
        assert_eq!(err.code(), "opcall-syntax-error", "input {:?}", src);
    }
}

#[test]
fn test_literal_short_circuit_warns() {
    let args = parse_arguments(r#"a || "x" || b"#).unwrap();
    assert_eq!(
        args.exprs,
        vec![Expr::Or(Box::new(reference("a")), Box::new(literal("x")))]
    );
    assert_eq!(args.warnings.len(), 1);
}

#[test]
fn test_trailing_literal_does_not_warn() {
    let args = parse_arguments("a || b || 3").unwrap();
    assert!(args.warnings.is_empty());
}

#[test]
fn test_expr_display() {
    let args = parse_arguments(r#"a.b || "x\"y" || nil $HOME"#).unwrap();
    let shown: Vec<String> = args.exprs.iter().map(Expr::to_string).collect();
    assert_eq!(shown, vec![r#"a.b || "x\"y""#, "$HOME"]);
}

// ── Paths ───────────────────────────────────────────────────────────

#[test]
fn test_path_parse() {
    let p = Path::parse("$.meta.list[1].name").unwrap();
    assert_eq!(p.segments(), &["meta", "list", "1", "name"]);
    assert_eq!(p.to_string(), "meta.list.1.name");

    let p = Path::parse("a[x.y]").unwrap();
    assert_eq!(p.segments(), &["a", "x.y"]);

    assert!(Path::parse("").unwrap().is_root());
    assert!(Path::parse("$").unwrap().is_root());
}

#[test]
fn test_path_parse_errors() {
    for src in ["a[b", "a]b", "a[[b]]"] {
        let err = Path::parse(src).unwrap_err();
        assert_eq!(err.code(), "opcall-syntax-error", "input {:?}", src);
    }
}

#[test]
fn test_path_resolve_by_name_and_canonical() {
    let tree = doc("jobs:\n  - name: api\n    port: 1\n  - name: web\n    port: 2\n");
    let p = Path::parse("jobs.web.port").unwrap();
    assert_eq!(p.resolve(&tree).unwrap(), &Value::Int(2));
    assert_eq!(p.canonical(&tree).unwrap().to_string(), "jobs.1.port");
    assert_eq!(
        Path::parse("jobs.0.port").unwrap().resolve(&tree).unwrap(),
        &Value::Int(1)
    );
}

#[test]
fn test_path_resolve_errors() {
    let tree = doc("a:\n  b: 1\nlist: [1]\n");
    let err = Path::parse("a.c").unwrap().resolve(&tree).unwrap_err();
    assert_eq!(
        err,
        Error::NotFound {
            path: "a.c".to_string()
        }
    );
    let err = Path::parse("a.b.c").unwrap().resolve(&tree).unwrap_err();
    assert_eq!(err.code(), "type-mismatch");
    let err = Path::parse("list.4").unwrap().resolve(&tree).unwrap_err();
    assert_eq!(err.code(), "unresolved-reference");
}

#[test]
fn test_path_resolvable_ancestor() {
    let tree = doc("jobs:\n  - name: api\n    port: 1\n");
    let p = Path::parse("jobs.api.missing.deeper").unwrap();
    assert_eq!(p.resolvable_ancestor(&tree).unwrap().to_string(), "jobs.0");
    assert!(Path::parse("nothing.here")
        .unwrap()
        .resolvable_ancestor(&tree)
        .is_none());
}

#[test]
fn test_path_glob() {
    let tree = doc("jobs:\n  - name: api\n    port: 1\n  - name: web\n    port: 2\n");
    let found: Vec<String> = Path::parse("jobs.*.port")
        .unwrap()
        .glob(&tree)
        .unwrap()
        .iter()
        .map(Path::to_string)
        .collect();
    assert_eq!(found, vec!["jobs.0.port", "jobs.1.port"]);
}

#[test]
fn test_path_glob_skips_non_matching_children() {
    let tree = doc("a:\n  port: 1\nb: {}\nc: 3\n");
    let found: Vec<String> = Path::parse("*.port")
        .unwrap()
        .glob(&tree)
        .unwrap()
        .iter()
        .map(Path::to_string)
        .collect();
    assert_eq!(found, vec!["a.port"]);
}

#[test]
fn test_path_under() {
    let ab = Path::parse("a.b").unwrap();
    assert!(Path::parse("a.b.c").unwrap().under(&ab));
    assert!(!ab.under(&ab));
    assert!(!Path::parse("a.bc").unwrap().under(&ab));
    assert!(!ab.under(&Path::root()));
}

// ── Expressions ─────────────────────────────────────────────────────

#[test]
fn test_or_resolves_first_present_side() {
    let tree = doc("meta:\n  flag: false\n");
    let env = Env::default();
    let expr = &parse_arguments("meta.missing || meta.flag || true")
        .unwrap()
        .exprs[0];
    assert_eq!(expr.evaluate(&tree, &env).unwrap(), Value::Bool(false));
}

#[test]
fn test_env_var_from_fixed_environment() {
    let tree = Value::new_map();
    let env = fixed_env(&[("GREETING", "hello"), ("EMPTY", "")]);
    let expr = Expr::EnvVar("GREETING".to_string());
    assert_eq!(expr.resolve(&tree, &env).unwrap(), literal("hello"));

    let err = Expr::EnvVar("EMPTY".to_string())
        .evaluate(&tree, &env)
        .unwrap_err();
    assert_eq!(
        err,
        Error::EnvVar {
            name: "EMPTY".to_string()
        }
    );
}

#[test]
fn test_env_var_in_operator_calls() {
    let options = EvalOptions {
        env: fixed_env(&[("GREETING", "hello")]),
        ..EvalOptions::default()
    };
    let (tree, result) = run(
        "a: (( concat $GREETING \" world\" ))\nb: (( grab $UNSET || \"fallback\" ))\n",
        options.clone(),
    );
    assert!(result.is_ok());
    assert_eq!(tree, doc("a: hello world\nb: fallback\n"));

    let (_, result) = run("a: (( concat $UNSET \"!\" ))\n", options);
    let errors = result.unwrap_err();
    assert_eq!(errors.errors[0].code(), "unset-environment-variable");
}

#[test]
fn test_dependencies_climb_to_existing_ancestor() {
    let tree = doc("meta: (( grab other ))\nother: {}\n");
    let expr = reference("meta.y");
    let deps: Vec<String> = expr
        .dependencies(&tree, &[])
        .iter()
        .map(Path::to_string)
        .collect();
    assert_eq!(deps, vec!["meta"]);
}

#[test]
fn test_dependencies_include_calls_inside_referenced_subtree() {
    let tree = doc("meta:\n  x: 1\n  y: {z: 2}\nother: 3\n");
    let known: Vec<Path> = ["meta", "meta.y.z", "other", "meta.x"]
        .iter()
        .map(|p| Path::parse(p).unwrap())
        .collect();
    let deps: Vec<String> = reference("meta")
        .dependencies(&tree, &known)
        .iter()
        .map(Path::to_string)
        .collect();
    assert_eq!(deps, vec!["meta", "meta.y.z", "meta.x"]);
}

// ── Data flow ───────────────────────────────────────────────────────

#[test]
fn test_dataflow_single_concat() {
    let order = flow("foo: (( concat \"foo\" \":\" \"bar\" ))\n", Phase::Eval).unwrap();
    assert_eq!(order, vec!["foo"]);
}

#[test]
fn test_dataflow_orders_dependencies_first() {
    let src = "a: (( grab b ))\nb: (( grab c ))\nc: (( concat \"x\" \"y\" ))\nd: (( grab c ))\n";
    assert_eq!(flow(src, Phase::Eval).unwrap(), vec!["c", "b", "d", "a"]);
}

#[test]
fn test_dataflow_ties_break_by_path() {
    let src = "z: (( concat \"a\" \"b\" ))\nm: (( concat \"a\" \"b\" ))\na: (( concat \"a\" \"b\" ))\n";
    assert_eq!(flow(src, Phase::Eval).unwrap(), vec!["a", "m", "z"]);
}

#[test]
fn test_dataflow_is_deterministic() {
    let src = "\
a: (( grab meta.x || meta.y ))
b: (( grab a ))
c: (( concat b \"-\" a ))
meta:
  x: (( grab meta.y ))
  y: (( concat \"p\" \"q\" ))
list:
  - name: one
    v: (( grab c ))
  - name: two
    v: (( grab list.one.v ))
";
    let first = flow(src, Phase::Eval).unwrap();
    for _ in 0..10 {
        assert_eq!(flow(src, Phase::Eval).unwrap(), first);
    }
    assert_eq!(
        first,
        vec!["meta.y", "meta.x", "a", "b", "c", "list.one.v", "list.two.v"]
    );
}

#[test]
fn test_dataflow_locations_use_names_in_tagged_lists() {
    let mut ev = Evaluator::new(doc(
        "jobs:\n  - name: api\n    port: (( grab meta.port ))\nmeta:\n  port: 1\n",
    ));
    let ops = ev.data_flow(Phase::Eval).unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].location().to_string(), "jobs.api.port");
    assert_eq!(ops[0].canonical().to_string(), "jobs.0.port");
    assert_eq!(ops[0].name(), "grab");
}

#[test]
fn test_dataflow_grab_of_subtree_runs_after_calls_inside_it() {
    let src = "a: (( grab meta ))\nb: 1\nmeta:\n  x: (( grab b ))\n";
    assert_eq!(flow(src, Phase::Eval).unwrap(), vec!["meta.x", "a"]);

    let (tree, result) = run(src, EvalOptions::default());
    result.unwrap();
    assert_eq!(tree.get("a"), Some(&doc("x: 1\n")));
}

#[test]
fn test_dataflow_numeric_tag_values_locate_by_position() {
    let src = "\
list:
  - name: \"1\"
    v: (( grab z ))
  - name: \"0\"
    v: keep
z: 5
";
    assert_eq!(flow(src, Phase::Eval).unwrap(), vec!["list.0.v"]);

    let (tree, result) = run(src, EvalOptions::default());
    result.unwrap();
    assert_eq!(
        tree.get("list"),
        Some(&doc("- {name: \"1\", v: 5}\n- {name: \"0\", v: keep}\n"))
    );

    let (tree, result) = run(
        "list:\n  - {id: 1, v: (( grab z ))}\n  - {id: 0, v: keep}\nz: 5\n",
        EvalOptions::default(),
    );
    result.unwrap();
    assert_eq!(
        tree.get("list"),
        Some(&doc("- {id: 1, v: 5}\n- {id: 0, v: keep}\n"))
    );
}

#[test]
fn test_dataflow_duplicate_tag_values_locate_by_position() {
    let src = "\
list:
  - name: a
    v: (( concat \"x\" \"y\" ))
  - name: a
    v: (( concat \"p\" \"q\" ))
";
    assert_eq!(flow(src, Phase::Eval).unwrap(), vec!["list.a.v", "list.1.v"]);

    let (tree, result) = run(src, EvalOptions::default());
    result.unwrap();
    assert_eq!(
        tree.get("list"),
        Some(&doc("- {name: a, v: xy}\n- {name: a, v: pq}\n"))
    );
}

#[test]
fn test_dataflow_filters_by_phase() {
    let src = "\
meta:
  base: {x: 1}
a:
  inherit: (( inject meta.base ))
b: (( param \"needed\" ))
c: (( grab meta.base.x ))
";
    assert_eq!(flow(src, Phase::Merge).unwrap(), vec!["a.inherit"]);
    assert_eq!(flow(src, Phase::Eval).unwrap(), vec!["c"]);
    assert_eq!(flow(src, Phase::Param).unwrap(), vec!["b"]);
}

#[test]
fn test_dataflow_direct_cycle() {
    let errors = flow("a: (( grab b ))\nb: (( grab a ))\n", Phase::Eval).unwrap_err();
    assert_eq!(errors.errors, vec![Error::Cycle]);
}

#[test]
fn test_dataflow_indirect_cycle() {
    let src = "a: (( grab b ))\nb: (( grab c ))\nc: (( grab a ))\n";
    let errors = flow(src, Phase::Eval).unwrap_err();
    assert_eq!(errors.errors, vec![Error::Cycle]);
}

#[test]
fn test_dataflow_cycle_through_or_operand() {
    let src = "a: (( grab nothing || b ))\nb: (( grab c ))\nc: (( grab a ))\n";
    let errors = flow(src, Phase::Eval).unwrap_err();
    assert_eq!(errors.errors, vec![Error::Cycle]);
}

#[test]
fn test_dataflow_cycle_across_phases() {
    let src = "meta:\n  bar: (( grab meta.foo ))\n  foo: (( inject meta.bar ))\n";
    for phase in [Phase::Merge, Phase::Eval] {
        let errors = flow(src, phase).unwrap_err();
        assert_eq!(errors.errors, vec![Error::Cycle], "phase {}", phase);
    }
}

#[test]
fn test_dataflow_shared_operand_without_cycle() {
    let src = "a: (( grab c || d ))\nb: (( grab c || d ))\nc: 1\nd: (( grab c ))\n";
    assert_eq!(flow(src, Phase::Eval).unwrap(), vec!["d", "a", "b"]);
}

#[test]
fn test_dataflow_reports_syntax_errors_in_own_phase() {
    let src = "a: (( grab x || ))\n";
    assert!(flow(src, Phase::Merge).is_ok());
    let errors = flow(src, Phase::Eval).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors.errors[0].code(), "opcall-syntax-error");
    assert!(errors.errors[0].to_string().starts_with("$.a: "));
}

#[test]
fn test_dataflow_collects_warnings() {
    let mut ev = Evaluator::new(doc(
        "meta:\n  other: x\nval: (( grab meta.enoent || nil || meta.other ))\n",
    ));
    ev.data_flow(Phase::Eval).unwrap();
    assert_eq!(ev.warnings.len(), 1);
    assert_eq!(
        ev.warnings[0].src,
        "(( grab meta.enoent || nil || meta.other ))"
    );

    ev.warnings.clear();
    ev.data_flow(Phase::Merge).unwrap();
    assert!(ev.warnings.is_empty());
}

// ── Running ─────────────────────────────────────────────────────────

#[test]
fn test_concat_end_to_end() {
    let result = crate::merge_yaml(
        &["foo: (( concat \"foo\" \":\" \"bar\" ))\n"],
        EvalOptions::default(),
    );
    assert!(result.errors.is_empty());
    assert_eq!(result.value, doc("foo: \"foo:bar\"\n"));
}

#[test]
fn test_short_circuit_to_nil_warns_once() {
    let result = crate::merge_yaml(
        &["meta:\n  other: x\nval: (( grab meta.enoent || nil || meta.other ))\n"],
        EvalOptions::default(),
    );
    assert!(result.errors.is_empty());
    assert_eq!(result.value.get("val"), Some(&Value::Null));
    assert_eq!(result.warnings.len(), 1);
}

#[test]
fn test_inject_copies_are_independent() {
    let src = "\
meta:
  template:
    properties:
      color: blue
      size: 1
a:
  inherit: (( inject meta.template ))
  properties:
    color: red
b:
  inherit: (( inject meta.template ))
  properties:
    size: 2
c:
  inherit: (( inject meta.template ))
";
    let mut ev = Evaluator::new(doc(src));
    ev.run().unwrap();
    assert_eq!(
        ev.tree,
        doc("\
meta:
  template:
    properties:
      color: blue
      size: 1
a:
  properties:
    color: red
    size: 1
b:
  properties:
    color: blue
    size: 2
c:
  properties:
    color: blue
    size: 1
")
    );

    let color = Path::parse("a.properties.color").unwrap();
    *color.resolve_mut(&mut ev.tree).unwrap() = Value::from("green");
    let c = Path::parse("c.properties.color").unwrap();
    assert_eq!(c.resolve(&ev.tree).unwrap(), &Value::from("blue"));
    let t = Path::parse("meta.template.properties.color").unwrap();
    assert_eq!(t.resolve(&ev.tree).unwrap(), &Value::from("blue"));
}

#[test]
fn test_inject_call_site_wins() {
    let src = "\
meta:
  job:
    name: default
    templates: [a, b]
    properties:
      x: 1
      y: 1
job:
  inherit: (( inject meta.job ))
  name: mine
  templates: [c]
  properties:
    y: 2
";
    let (tree, result) = run(src, EvalOptions::default());
    result.unwrap();
    let job = tree.get("job").unwrap();
    assert_eq!(
        job,
        &doc("name: mine\ntemplates: [a, b, c]\nproperties:\n  x: 1\n  y: 2\n")
    );
    let keys: Vec<&String> = job.as_map().unwrap().keys().collect();
    assert_eq!(keys, vec!["name", "templates", "properties"]);
}

#[test]
fn test_inject_new_keys_take_call_site_position() {
    let src = "\
meta:
  base: {x: 1, y: 2}
job:
  first: 0
  inherit: (( inject meta.base ))
  last: 3
";
    let (tree, result) = run(src, EvalOptions::default());
    result.unwrap();
    let keys: Vec<&String> = tree.get("job").unwrap().as_map().unwrap().keys().collect();
    assert_eq!(keys, vec!["first", "x", "y", "last"]);
}

#[test]
fn test_inject_rejects_non_map() {
    let (_, result) = run(
        "meta:\n  list: [1]\njob:\n  inherit: (( inject meta.list ))\n",
        EvalOptions::default(),
    );
    let errors = result.unwrap_err();
    assert_eq!(errors.errors[0].code(), "operator-failure");
}

#[test]
fn test_undefined_operator_is_located() {
    let (_, result) = run("x:\n  y: (( frobnicate 1 ))\n", EvalOptions::default());
    let errors = result.unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors.errors[0].code(), "undefined-operator");
    assert_eq!(
        errors.errors[0].to_string(),
        "$.x.y: unknown operator `frobnicate`: operator not defined"
    );
}

#[test]
fn test_errors_are_batched_across_calls() {
    let (_, result) = run(
        "a: (( grab nope ))\nb: (( concat \"x\" ))\nc: (( frob ))\n",
        EvalOptions::default(),
    );
    let errors = result.unwrap_err();
    assert_eq!(errors.len(), 3);
    let shown = errors.to_string();
    assert!(shown.starts_with("3 error(s) detected:"));
    let lines: Vec<&str> = shown.lines().skip(1).collect();
    let mut sorted = lines.clone();
    sorted.sort();
    assert_eq!(lines, sorted);
}

#[test]
fn test_param_errors_take_precedence() {
    let (_, result) = run(
        "a: (( param \"need a\" ))\nb: (( grab nope ))\n",
        EvalOptions::default(),
    );
    let errors = result.unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors.errors[0].code(), "required-parameter");
    assert_eq!(errors.errors[0].to_string(), "$.a: need a");
}

#[test]
fn test_cycle_aborts_the_run() {
    let (_, result) = run(
        "a: (( grab b ))\nb: (( grab a ))\nc: (( param \"p\" ))\n",
        EvalOptions::default(),
    );
    assert_eq!(result.unwrap_err().errors, vec![Error::Cycle]);
}

#[test]
fn test_max_depth() {
    let options = EvalOptions {
        max_depth: 3,
        ..EvalOptions::default()
    };
    let (_, result) = run("a:\n  b:\n    c:\n      d: 1\n", options.clone());
    let errors = result.unwrap_err();
    assert_eq!(errors.errors, vec![Error::MaxDepth { max_depth: 3 }]);

    let (_, result) = run("a:\n  b: 1\n", options);
    assert!(result.is_ok());
}

#[test]
fn test_prune_paths() {
    let options = EvalOptions {
        prune: ["meta", "jobs.*.secret", "list.0", "missing.key"]
            .iter()
            .map(|p| Path::parse(p).unwrap())
            .collect(),
        ..EvalOptions::default()
    };
    let src = "\
meta:
  x: 1
jobs:
  a: {secret: 1, keep: 1}
  b: {keep: 2}
list: [1, 2]
out: (( grab meta.x ))
";
    let (tree, result) = run(src, options);
    result.unwrap();
    assert_eq!(
        tree,
        doc("jobs:\n  a: {keep: 1}\n  b: {keep: 2}\nlist: [1, 2]\nout: 1\n")
    );
}

#[test]
fn test_skip_eval_only_prunes() {
    let options = EvalOptions {
        prune: vec![Path::parse("meta").unwrap()],
        skip_eval: true,
        ..EvalOptions::default()
    };
    let (tree, result) = run("meta:\n  x: 1\nout: (( grab meta.x ))\n", options);
    result.unwrap();
    assert_eq!(tree, doc("out: (( grab meta.x ))\n"));
}

#[test]
fn test_failed_run_does_not_prune() {
    let options = EvalOptions {
        prune: vec![Path::parse("meta").unwrap()],
        ..EvalOptions::default()
    };
    let (tree, result) = run("meta:\n  x: 1\nout: (( grab nope ))\n", options);
    assert!(result.is_err());
    assert!(tree.get("meta").is_some());
}

#[test]
fn test_defer_is_not_evaluated() {
    let (tree, result) = run("out: (( defer grab nope ))\n", EvalOptions::default());
    result.unwrap();
    assert_eq!(tree.get("out"), Some(&Value::from("(( grab nope ))")));
}

// ── Custom operators ────────────────────────────────────────────────

struct Shout;

impl Operator for Shout {
    fn phase(&self) -> Phase {
        Phase::Eval
    }

    fn run(&self, ev: &mut Evaluator, args: &[Expr]) -> Result<Response, Error> {
        let value = crate::builtins::evaluate(ev, &args[0])?;
        Ok(Response::replace(value.to_string().to_uppercase()))
    }
}

#[test]
fn test_custom_registry() {
    let mut registry = Registry::empty();
    registry.register("shout", Shout);
    assert!(registry.contains("shout"));
    assert!(!registry.contains("grab"));

    let mut ev = Evaluator::with_registry(
        doc("a: (( shout b ))\nb: hey\nc: (( grab b ))\n"),
        registry,
    );
    let errors = ev.run().unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors.errors[0].code(), "undefined-operator");
    assert_eq!(ev.tree.get("a"), Some(&Value::from("HEY")));
}

// ── Static addresses ────────────────────────────────────────────────

#[test]
fn test_expand_range() {
    let mut ips = Vec::new();
    for range in ["10.0.0.2 - 10.0.0.3", "10.0.0.90", "10.0.0.100"] {
        ips.extend(expand_range(range).unwrap());
    }
    let shown: Vec<String> = ips.iter().map(|ip| ip.to_string()).collect();
    assert_eq!(
        shown,
        vec!["10.0.0.2", "10.0.0.3", "10.0.0.90", "10.0.0.100"]
    );
}

#[test]
fn test_expand_range_rolls_over_octets() {
    let shown: Vec<String> = expand_range("10.0.0.254-10.0.1.1")
        .unwrap()
        .iter()
        .map(|ip| ip.to_string())
        .collect();
    assert_eq!(shown, vec!["10.0.0.254", "10.0.0.255", "10.0.1.0", "10.0.1.1"]);
}

#[test]
fn test_static_range_indexes_without_expanding() {
    let range = StaticRange::parse("10.0.0.0 - 10.255.255.255").unwrap();
    assert_eq!(range.size(), 1 << 24);
    assert_eq!(range.get(0).map(|ip| ip.to_string()).as_deref(), Some("10.0.0.0"));
    assert_eq!(
        range.get((1 << 24) - 1).map(|ip| ip.to_string()).as_deref(),
        Some("10.255.255.255")
    );
    assert_eq!(range.get(1 << 24), None);
    assert_eq!(range.get(u64::MAX), None);

    let single = StaticRange::parse("255.255.255.255").unwrap();
    assert_eq!(single.size(), 1);
    assert_eq!(single.get(1), None);
}

#[test]
fn test_expand_range_errors() {
    for range in ["10.0.0.9 - 10.0.0.1", "10.0.0", "a - b", "1.1.1.1 - 1.1.1.2 - 1.1.1.3"] {
        assert!(expand_range(range).is_err(), "range {:?}", range);
    }
}

#[test]
fn test_static_ip_conflict_names_both_claimants() {
    let src = "\
networks:
  - name: net1
    subnets:
      - static: [10.0.0.10 - 10.0.0.20]
jobs:
  - name: api
    instances: 3
    networks:
      - name: net1
        static_ips: (( static_ips 0 1 2 ))
  - name: worker
    instances: 3
    networks:
      - name: net1
        static_ips: (( static_ips 0 1 2 ))
";
    let mut ev = Evaluator::new(doc(src));
    let errors = ev.run().unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors.errors[0],
        Error::Conflict {
            address: "10.0.0.10".to_string(),
            claimant: "api/0".to_string(),
            wanted_by: "worker/0".to_string(),
        }
        .located("jobs.worker.networks.net1.static_ips")
    );
    assert_eq!(ev.state.ledger.len(), 3);
    assert_eq!(ev.state.ledger.get("10.0.0.12"), Some(&"api/2".to_string()));
}

#[test]
fn test_static_ips_ledger_resets_between_runs() {
    let src = "\
networks:
  - name: net1
    subnets:
      - static: [10.0.0.10 - 10.0.0.20]
jobs:
  - name: api
    instances: 1
    networks:
      - name: net1
        static_ips: (( static_ips 0 ))
";
    let mut first = Evaluator::new(doc(src));
    first.run().unwrap();
    let mut second = Evaluator::new(doc(src));
    second.state = first.state.clone();
    second.run().unwrap();
    let ips = Path::parse("jobs.api.networks.net1.static_ips").unwrap();
    assert_eq!(
        ips.resolve(&second.tree).unwrap(),
        &Value::Seq(vec![Value::from("10.0.0.10")])
    );
}

// ── Output ──────────────────────────────────────────────────────────

#[test]
fn test_json_output_keeps_key_order() {
    let tree = doc("b: 1\na:\n  z: true\n  y: [1.5, null]\n");
    assert_eq!(
        serde_json::to_string(&crate::json::to_json(&tree)).unwrap(),
        r#"{"b":1,"a":{"z":true,"y":[1.5,null]}}"#
    );
}

#[test]
fn test_yaml_output_round_trips_tree() {
    let tree = doc("b: 1\na:\n  - x\n  - {k: v}\n");
    let text = crate::yaml::to_yaml_string(&tree).unwrap();
    assert!(text.starts_with("b: 1\n"));
    assert_eq!(doc(&text), tree);
}
