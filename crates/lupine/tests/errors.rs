use std::rc::Rc;

use lupine::{BridgeConfig, BridgeError, HostError, LuaStatus, MultiValue, Runtime, Stack, Value, smallvec};
use pretty_assertions::assert_eq;

fn expect_runtime(error: BridgeError) -> (LuaStatus, Value, Option<String>) {
    match error {
        BridgeError::Runtime {
            status,
            payload,
            traceback,
        } => (status, payload, traceback),
        other => panic!("expected runtime error, got {other:?}"),
    }
}

fn expect_host_message(error: BridgeError) -> String {
    match error {
        BridgeError::Host { message } => message,
        other => panic!("expected host error, got {other:?}"),
    }
}

#[test]
fn staged_value_reaches_the_interpreter_unchanged() {
    let runtime = Runtime::new().unwrap();
    let fail = runtime
        .create_raw_function(Rc::new(|stack: &Stack<'_>| Err(stack.stage(&Value::from("E")))))
        .unwrap();
    runtime.set_global("fail", fail).unwrap();

    let results = runtime
        .execute("local ok, e = pcall(fail) return ok, e, type(e)", [])
        .unwrap();
    assert_eq!(
        results.as_slice(),
        &[Value::Boolean(false), Value::from("E"), Value::from("string")]
    );
}

#[test]
fn raised_tables_keep_their_identity() {
    let runtime = Runtime::new().unwrap();
    let payload = runtime.table_from([("code", Value::Integer(7))]).unwrap();
    runtime.set_global("payload", payload.clone()).unwrap();

    let thrower = runtime
        .create_function(|lua, _| Err(BridgeError::raise(lua.get_global("payload")?)))
        .unwrap();
    runtime.set_global("thrower", thrower).unwrap();
    let same = runtime
        .eval("select(2, pcall(thrower)) == payload")
        .unwrap();
    assert_eq!(same, Value::Boolean(true));

    let error = runtime.execute("error(payload)", []).unwrap_err();
    let (status, raised, _) = expect_runtime(error);
    assert_eq!(status, LuaStatus::ErrRun);
    assert_eq!(raised, Value::Table(payload));
}

#[test]
fn interpreter_errors_carry_message_and_traceback() {
    let runtime = Runtime::new().unwrap();
    let error = runtime
        .execute("local function inner() error('boom') end inner()", [])
        .unwrap_err();
    assert_eq!(error.to_string(), "lupine:1: boom");
    let (status, payload, traceback) = expect_runtime(error);
    assert_eq!(status, LuaStatus::ErrRun);
    assert_eq!(payload, Value::from("lupine:1: boom"));
    let traceback = traceback.unwrap();
    assert!(traceback.contains("stack traceback:"), "{traceback}");
    assert!(traceback.contains("inner"), "{traceback}");
}

#[test]
fn traceback_capture_can_be_disabled() {
    let runtime = Runtime::with_config(BridgeConfig::new().capture_traceback(false)).unwrap();
    let error = runtime.execute("error('plain')", []).unwrap_err();
    assert_eq!(error.traceback(), None);
    assert_eq!(error.payload(), Some(&Value::from("lupine:1: plain")));
}

#[test]
fn host_errors_round_trip_through_the_interpreter() {
    let runtime = Runtime::new().unwrap();
    let refuse = runtime
        .create_function(|_, _| Err(BridgeError::host("refused")))
        .unwrap();
    runtime.set_global("refuse", refuse).unwrap();

    let seen = runtime
        .execute("local ok, e = pcall(refuse) return tostring(e), e.message", [])
        .unwrap();
    assert_eq!(seen.as_slice(), &[Value::from("refused"), Value::from("refused")]);

    let error = runtime.execute("refuse()", []).unwrap_err();
    assert_eq!(expect_host_message(error), "refused");
}

#[test]
fn host_errors_rethrown_by_scripts_stay_host_errors() {
    let runtime = Runtime::new().unwrap();
    let refuse = runtime
        .create_function(|_, _| Err(BridgeError::host("refused")))
        .unwrap();
    runtime.set_global("refuse", refuse).unwrap();

    let error = runtime
        .execute("local ok, e = pcall(refuse) error(e)", [])
        .unwrap_err();
    assert_eq!(expect_host_message(error), "refused");
}

#[test]
fn errors_pass_through_nested_host_and_script_frames() {
    let runtime = Runtime::new().unwrap();
    let call = runtime
        .create_function(|_, args| match args.first() {
            Some(Value::Function(function)) => function.call([]),
            _ => Err(BridgeError::host("expected a function")),
        })
        .unwrap();
    runtime.set_global("call", call).unwrap();

    let error = runtime
        .execute("call(function() error({ tag = 'inner' }) end)", [])
        .unwrap_err();
    let (_, payload, _) = expect_runtime(error);
    let Value::Table(table) = payload else {
        panic!("expected table payload, got {payload:?}");
    };
    assert_eq!(table.get("tag").unwrap(), Value::from("inner"));
}

#[test]
fn host_errors_are_visible_as_payloads() {
    let runtime = Runtime::new().unwrap();
    let refuse = runtime
        .create_function(|_, _| Err(BridgeError::host("refused")))
        .unwrap();
    runtime.set_global("refuse", refuse).unwrap();

    let payload = runtime.eval("select(2, pcall(refuse))").unwrap();
    let error = payload.downcast_host::<HostError>().unwrap();
    assert_eq!(error.error().to_string(), "refused");
}

#[test]
fn syntax_errors_are_reported_without_running() {
    let runtime = Runtime::new().unwrap();
    let error = runtime.execute("return (", []).unwrap_err();
    assert_eq!(error.status(), Some(LuaStatus::ErrSyntax));
    let BridgeError::Syntax { message } = error else {
        panic!("expected syntax error");
    };
    assert!(message.starts_with("lupine:1:"), "{message}");
}

#[test]
fn handler_panics_become_interpreter_errors() {
    let runtime = Runtime::new().unwrap();
    let explode = runtime
        .create_function(|_, _| -> Result<MultiValue, BridgeError> { panic!("kaboom") })
        .unwrap();
    runtime.set_global("explode", explode).unwrap();

    let message = runtime
        .eval("select(2, pcall(explode)).message")
        .unwrap();
    assert_eq!(message, Value::from("host handler panicked: kaboom"));

    // the interpreter stays usable
    assert_eq!(runtime.eval("40 + 2").unwrap(), Value::Integer(42));
}

#[test]
fn handlers_return_multiple_values() {
    let runtime = Runtime::new().unwrap();
    let pair = runtime
        .create_function(|_, _| Ok(smallvec![Value::Integer(1), Value::from("two")]))
        .unwrap();
    runtime.set_global("pair", pair).unwrap();
    let results = runtime
        .execute("local a, b = pair() return b, a", [])
        .unwrap();
    assert_eq!(results.as_slice(), &[Value::from("two"), Value::Integer(1)]);
}

#[test]
fn overreported_result_counts_are_errors() {
    let runtime = Runtime::new().unwrap();
    let liar = runtime
        .create_raw_function(Rc::new(|stack: &Stack<'_>| Ok(stack.top() + 5)))
        .unwrap();
    let error = liar.call([Value::Integer(1)]).unwrap_err();
    assert_eq!(
        expect_host_message(error),
        "handler reported 6 results with 1 values on the stack"
    );
}
