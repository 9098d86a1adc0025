use lupine::{BridgeError, Resumed, Runtime, Value, smallvec};
use pretty_assertions::assert_eq;

fn runtime_with_add() -> Runtime {
    let runtime = Runtime::new().unwrap();
    let add = runtime
        .create_function(|_, args| {
            let sum: i64 = args.iter().map(Value::to_integer).sum::<Result<_, _>>()?;
            Ok(smallvec![Value::Integer(sum)])
        })
        .unwrap();
    runtime.set_global("add", add).unwrap();
    runtime
}

#[test]
fn host_functions_run_inside_coroutines() {
    let runtime = runtime_with_add();
    let results = runtime
        .execute(
            "local co = coroutine.wrap(function(a) local b = coroutine.yield(add(a, 1)) return add(b, 10) end) \
             return co(1), co(5)",
            [],
        )
        .unwrap();
    assert_eq!(results.as_slice(), &[Value::Integer(2), Value::Integer(15)]);
}

#[test]
fn host_can_drive_a_coroutine() {
    let runtime = runtime_with_add();
    let body = runtime
        .load("local x = ... local y = coroutine.yield(x * 2) return y + add(1, 2)", "body")
        .unwrap();
    let thread = runtime.create_thread(&body).unwrap();

    assert_eq!(thread.resume([Value::Integer(5)]).unwrap(), Resumed::Yielded(smallvec![Value::Integer(10)]));
    assert_eq!(thread.resume([Value::Integer(1)]).unwrap(), Resumed::Finished(smallvec![Value::Integer(4)]));

    let error = thread.resume([]).unwrap_err();
    assert_eq!(error.to_string(), "cannot resume dead coroutine");
}

#[test]
fn coroutine_failures_carry_their_payload() {
    let runtime = runtime_with_add();
    let body = runtime.load("coroutine.yield() add('x')", "body").unwrap();
    let thread = runtime.create_thread(&body).unwrap();
    assert_eq!(thread.resume([]).unwrap(), Resumed::Yielded(smallvec![]));

    let error = thread.resume([]).unwrap_err();
    assert!(matches!(error, BridgeError::Conversion { from: "string", .. }), "{error:?}");

    let body = runtime.load("error('inside')", "body").unwrap();
    let thread = runtime.create_thread(&body).unwrap();
    let error = thread.resume([]).unwrap_err();
    assert_eq!(error.payload(), Some(&Value::from("body:1: inside")));
    assert!(error.traceback().is_some());
}

#[test]
fn host_calls_from_a_coroutine_use_its_stack() {
    let runtime = Runtime::new().unwrap();
    let nested = runtime
        .create_function(|lua, _| {
            let value = lua.eval("select('#', coroutine.running()) + 1")?;
            Ok(smallvec![value, Value::Boolean(lua.eval("coroutine.isyieldable()")?.is_truthy())])
        })
        .unwrap();
    runtime.set_global("nested", nested).unwrap();

    let results = runtime
        .execute(
            "local co = coroutine.create(function() coroutine.yield(nested()) end) \
             local _, a, b = coroutine.resume(co) return a, b",
            [],
        )
        .unwrap();
    assert_eq!(results.as_slice(), &[Value::Integer(3), Value::Boolean(false)]);
}

#[test]
fn yielding_across_a_host_function_is_an_error() {
    let runtime = Runtime::new().unwrap();
    let call = runtime
        .create_function(|_, args| match args.first() {
            Some(Value::Function(function)) => function.call([]),
            _ => Err(BridgeError::host("expected a function")),
        })
        .unwrap();
    runtime.set_global("call", call).unwrap();

    let results = runtime
        .execute(
            "local co = coroutine.create(function() call(function() coroutine.yield(1) end) end) \
             local ok, e = coroutine.resume(co) return ok, tostring(e)",
            [],
        )
        .unwrap();
    assert_eq!(results[0], Value::Boolean(false));
    assert!(results[1].to_str().unwrap().contains("yield across"), "{}", results[1]);
}

#[test]
fn only_threads_can_be_resumed() {
    let runtime = Runtime::new().unwrap();
    let table = runtime.create_table().unwrap();
    let error = table.resume([]).unwrap_err();
    assert!(matches!(error, BridgeError::Conversion { from: "table", to: "thread" }));
}
