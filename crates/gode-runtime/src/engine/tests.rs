use super::*;
use crate::builtins::{BuiltinModule, BuiltinRegistry};
use crate::resolver::ModuleResolver;
use gode_kernel::{Callable, OperationQueue};
use gode_plugins::PluginManager;

struct Fixture {
    engine: RhaiEngine,
    state: SharedState,
    _queue: OperationQueue,
}

fn fixture() -> Fixture {
    let queue = OperationQueue::unbounded();
    let plugins = PluginManager::new(queue.sender(), 1).unwrap();
    let builtins = BuiltinRegistry::with_defaults(queue.sender(), plugins.workers());
    let marshal = Marshal::new(plugins.promises().clone());
    let mut resolver = ModuleResolver::new(std::env::temp_dir());
    resolver.add_builtin_namespace(PLUGIN_NAMESPACE);
    let state: SharedState = Arc::new(Mutex::new(HostState::new(resolver, plugins, builtins)));
    Fixture {
        engine: RhaiEngine::new(state.clone(), marshal),
        state,
        _queue: queue,
    }
}

#[test]
fn test_values_cross_the_boundary() {
    let mut fx = fixture();

    let value = fx
        .engine
        .eval("", r#"#{ name: "gode", tags: [1, 2.5, true, ()], ch: 'x' }"#)
        .unwrap();

    assert_eq!(value.get("name"), Some(&Value::from("gode")));
    assert_eq!(value.get("ch"), Some(&Value::from("x")));
    assert_eq!(
        value.get("tags"),
        Some(&Value::Array(vec![
            Value::Int(1),
            Value::Float(2.5),
            Value::Bool(true),
            Value::Null
        ]))
    );

    let back = fx.engine.marshal().to_dynamic(value.clone());
    assert_eq!(fx.engine.marshal().from_dynamic(back, None), value);
}

#[test]
fn test_top_level_variables_persist_between_evals() {
    let mut fx = fixture();

    fx.engine.eval("", "let total = 40;").unwrap();
    assert_eq!(fx.engine.eval("", "total + 2").unwrap(), Value::Int(42));
}

#[test]
fn test_print_is_captured() {
    let mut fx = fixture();

    fx.engine.eval("", r#"print("hello"); debug("dbg");"#).unwrap();
    let output = fx.engine.output();
    assert_eq!(output[0], "hello");
    assert!(output[1].contains("dbg"));
}

#[test]
fn test_script_functions_are_callable_from_the_host() {
    let mut fx = fixture();

    let value = fx
        .engine
        .eval("main.rhai", "fn double(x) { x * 2 } Fn(\"double\")")
        .unwrap();
    let Value::Function(Callable::Script(function)) = value else {
        panic!("expected a script function, got {:?}", value);
    };
    assert_eq!(function.name(), "double");

    let result = fx.engine.call_function(&function, vec![Value::Int(21)]);
    assert_eq!(result.unwrap(), Value::Int(42));
}

#[test]
fn test_closures_keep_captured_state() {
    let mut fx = fixture();

    let value = fx
        .engine
        .eval("", "let base = 10; |x| x + base")
        .unwrap();
    let Some(Callable::Script(function)) = value.as_callable().cloned() else {
        panic!("expected a closure");
    };

    let result = fx.engine.call_function(&function, vec![Value::Int(5)]);
    assert_eq!(result.unwrap(), Value::Int(15));
}

#[test]
fn test_thrown_values_become_exceptions() {
    let mut fx = fixture();

    let value = fx.engine.eval("", "fn boom() { throw \"bad input\"; } Fn(\"boom\")").unwrap();
    let Some(Callable::Script(function)) = value.as_callable().cloned() else {
        panic!("expected a function");
    };

    let err = fx.engine.call_function(&function, vec![]).unwrap_err();
    assert_eq!(err.thrown, Some(Value::from("bad input")));

    let err = fx
        .engine
        .eval("", r#"throw #{ message: "nope", plugin: "math", function: "add" };"#)
        .unwrap_err();
    let HostError::Script(exception) = err else {
        panic!("expected a script error");
    };
    assert_eq!(exception.to_string(), "[math.add] nope");
}

#[test]
fn test_compile_errors_name_the_source() {
    let mut fx = fixture();

    let err = fx.engine.eval("broken.rhai", "let = ;").unwrap_err();
    assert!(matches!(err, HostError::Compile { ref source_name, .. } if source_name == "broken.rhai"));
}

#[test]
fn test_builtin_import() {
    let mut fx = fixture();

    let value = fx
        .engine
        .eval("", r#"import "gode:core" as core; core::platform()"#)
        .unwrap();
    assert_eq!(value, Value::from(std::env::consts::OS));
    assert!(fx.state.lock().modules.contains_key("gode:core"));
}

#[test]
fn test_exports_register_up_to_the_arity_limit() {
    let mut fx = fixture();
    let sum = |args: Vec<Value>| Ok(Value::Int(args.iter().filter_map(Value::as_int).sum()));
    fx.state.lock().builtins.register(
        "gode:wide",
        BuiltinModule::new()
            .function("none", 0, |_| Ok(Value::from("empty")))
            .function("sum8", MAX_EXPORT_ARITY, sum)
            .function("sum9", MAX_EXPORT_ARITY + 1, sum),
    );

    let value = fx
        .engine
        .eval(
            "",
            r#"import "gode:wide" as w; `${w::none()} ${w::sum8(1, 2, 3, 4, 5, 6, 7, 8)}`"#,
        )
        .unwrap();
    assert_eq!(value, Value::from("empty 36"));

    assert!(
        fx.engine
            .eval("", r#"import "gode:wide" as w; w::sum9(1, 2, 3, 4, 5, 6, 7, 8, 9)"#)
            .is_err()
    );
}

#[test]
fn test_unknown_builtin_keeps_its_error_type() {
    let mut fx = fixture();

    let err = fx
        .engine
        .eval("", r#"import "gode:nothing" as n; 1"#)
        .unwrap_err();
    assert!(matches!(err, HostError::UnknownBuiltin(ref name) if name == "gode:nothing"));

    let err = fx.engine.eval("", r#"import "plugin:absent" as p; 1"#).unwrap_err();
    assert!(matches!(err, HostError::UnknownBuiltin(_)));
}

#[test]
fn test_foreign_script_function_is_rejected() {
    let mut fx = fixture();
    let foreign = ScriptFunction::new("elsewhere", 7_u32);

    let err = fx.engine.call_function(&foreign, vec![]).unwrap_err();
    assert!(err.message.contains("elsewhere"));
}
