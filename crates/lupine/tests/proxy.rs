use std::{cell::RefCell, rc::Rc};

use lupine::{
    BridgeConfig, BridgeError, HostFunction, HostList, HostMap, HostObject, Lua, Proxy, ProxyKind, RecordingTracer,
    Runtime, TraceEvent, Value, as_attrgetter, as_function, as_itemgetter, smallvec,
};
use pretty_assertions::assert_eq;

/// Records every key it is asked for and answers with `key!`.
#[derive(Default)]
struct Recorder {
    attrs: RefCell<Vec<String>>,
    items: RefCell<Vec<Value>>,
}

impl HostObject for Recorder {
    fn type_name(&self) -> &'static str {
        "Recorder"
    }

    fn get_attr(&self, _lua: &Lua, name: &str) -> Result<Value, BridgeError> {
        self.attrs.borrow_mut().push(name.to_owned());
        Ok(Value::String(format!("{name}!")))
    }

    fn get_item(&self, _lua: &Lua, key: &Value) -> Result<Value, BridgeError> {
        self.items.borrow_mut().push(key.clone());
        Ok(Value::String(format!("[{key}]")))
    }
}

struct Opaque;

impl HostObject for Opaque {
    fn type_name(&self) -> &'static str {
        "Opaque"
    }
}

fn expect_error_message(runtime: &Runtime, script: &str) -> String {
    let results = runtime
        .execute(&format!("local ok, e = pcall(function() {script} end) return ok, tostring(e)"), [])
        .unwrap();
    assert_eq!(results[0], Value::Boolean(false), "{script} did not fail");
    results[1].to_str().unwrap().to_owned()
}

#[test]
fn item_proxies_forward_keys_as_items() {
    let runtime = Runtime::new().unwrap();
    let recorder = Rc::new(Recorder::default());
    runtime.set_global("o", as_itemgetter(recorder.clone())).unwrap();

    assert_eq!(runtime.eval("o['x']").unwrap(), Value::from("[x]"));
    assert_eq!(runtime.eval("o.y").unwrap(), Value::from("[y]"));
    assert_eq!(runtime.eval("o[3]").unwrap(), Value::from("[3]"));
    assert_eq!(
        *recorder.items.borrow(),
        vec![Value::from("x"), Value::from("y"), Value::Integer(3)]
    );
    assert!(recorder.attrs.borrow().is_empty());
}

#[test]
fn attribute_proxies_forward_names_as_attributes() {
    let runtime = Runtime::new().unwrap();
    let recorder = Rc::new(Recorder::default());
    runtime.set_global("o", as_attrgetter(recorder.clone())).unwrap();

    assert_eq!(runtime.eval("o.name").unwrap(), Value::from("name!"));
    assert_eq!(*recorder.attrs.borrow(), vec!["name".to_owned()]);

    let message = expect_error_message(&runtime, "return o[1]");
    assert_eq!(message, "cannot convert number to attribute name");
}

#[test]
fn scripts_can_switch_access_mode() {
    let runtime = Runtime::new().unwrap();
    let map = Rc::new(HostMap::new([("colour", Value::from("teal"))]));
    runtime.set_global("m", as_itemgetter(map.clone())).unwrap();

    let results = runtime
        .execute(
            "local a = host.as_attrgetter(m) local i = host.as_itemgetter(a) return a.colour, i['colour']",
            [],
        )
        .unwrap();
    assert_eq!(results.as_slice(), &[Value::from("teal"), Value::from("teal")]);

    let rewrapped = runtime.eval("host.as_attrgetter(m)").unwrap();
    let Value::Host(proxy) = rewrapped else {
        panic!("expected a host value, got {rewrapped:?}");
    };
    assert_eq!(proxy.kind(), ProxyKind::Attribute);
    assert!(Rc::ptr_eq(proxy.object(), &(map.clone() as Rc<dyn HostObject>)));
}

#[test]
fn function_proxies_are_plain_functions() {
    let runtime = Runtime::new().unwrap();
    let square = Rc::new(HostFunction::named("square", |_, args| {
        let n = args.first().map_or(Ok(0), Value::to_integer)?;
        Ok(smallvec![Value::Integer(n * n)])
    }));
    runtime.set_global("square", as_function(square.clone())).unwrap();

    assert_eq!(runtime.eval("type(square)").unwrap(), Value::from("function"));
    assert_eq!(runtime.eval("square(9)").unwrap(), Value::Integer(81));

    let back = runtime.get_global("square").unwrap();
    assert_eq!(back, Value::Host(as_function(square.clone())));
    assert!(back.downcast_host::<HostFunction>().is_some());

    let results = runtime
        .execute("local f = host.as_function(host.as_attrgetter(square)) return type(f), f(4)", [])
        .unwrap();
    assert_eq!(results.as_slice(), &[Value::from("function"), Value::Integer(16)]);
}

#[test]
fn library_functions_validate_their_arguments() {
    let runtime = Runtime::new().unwrap();
    runtime.set_global("o", Value::host(Opaque)).unwrap();

    for script in [
        "host.as_attrgetter()",
        "host.as_itemgetter(o, o)",
        "host.as_function()",
        "host.iter()",
        "host.enumerate(o, 1, 2)",
    ] {
        assert_eq!(expect_error_message(&runtime, script), "invalid arguments", "{script}");
    }
    for script in [
        "host.as_attrgetter({})",
        "host.as_itemgetter(1)",
        "host.as_function('f')",
        "host.iterex(print)",
    ] {
        assert_eq!(expect_error_message(&runtime, script), "not a host object", "{script}");
    }
}

#[test]
fn unsupported_operations_name_the_object() {
    let runtime = Runtime::new().unwrap();
    runtime.set_global("o", Value::host(Opaque)).unwrap();

    assert_eq!(expect_error_message(&runtime, "o()"), "'Opaque' object does not support call");
    assert_eq!(
        expect_error_message(&runtime, "return o.field"),
        "'Opaque' object does not support attribute access"
    );
    assert_eq!(
        expect_error_message(&runtime, "return host.as_itemgetter(o)[1]"),
        "'Opaque' object does not support item access"
    );
    assert_eq!(
        expect_error_message(&runtime, "for _ in host.iter(o) do end"),
        "'Opaque' object does not support iteration"
    );
    assert_eq!(expect_error_message(&runtime, "return #o"), "'Opaque' object does not support length");
    assert_eq!(
        expect_error_message(&runtime, "for _ in pairs(o) do end"),
        "'Opaque' object does not support iteration"
    );

    let text = runtime.eval("tostring(o)").unwrap();
    assert!(text.to_str().unwrap().starts_with("<Opaque at 0x"), "{text}");
}

#[test]
fn containers_support_length_and_pairs() {
    let runtime = Runtime::new().unwrap();
    let list = Rc::new(HostList::new([Value::from("a"), Value::from("b")]));
    let map = Rc::new(HostMap::new([("x", Value::Integer(1)), ("y", Value::Integer(2))]));
    runtime.set_global("l", as_itemgetter(list.clone())).unwrap();
    runtime.set_global("m", as_attrgetter(map)).unwrap();

    assert_eq!(runtime.eval("#l").unwrap(), Value::Integer(2));
    assert_eq!(runtime.eval("#m").unwrap(), Value::Integer(2));
    runtime.execute("l[#l] = 'c'", []).unwrap();
    assert_eq!(list.len(), 3);

    let listed = runtime
        .eval("(function() local out = {} for i, v in pairs(l) do out[#out + 1] = i .. '=' .. v end return table.concat(out, ' ') end)()")
        .unwrap();
    assert_eq!(listed, Value::from("0=a 1=b 2=c"));

    let mapped = runtime
        .eval("(function() local out = {} for k, v in pairs(m) do out[#out + 1] = k .. '=' .. v end return table.concat(out, ' ') end)()")
        .unwrap();
    assert_eq!(mapped, Value::from("x=1 y=2"));
}

#[test]
fn metamethods_reject_foreign_receivers() {
    let runtime = Runtime::new().unwrap();
    runtime.set_global("o", Value::host(Opaque)).unwrap();
    assert_eq!(
        expect_error_message(&runtime, "return getmetatable(o).__index({}, 'x')"),
        "bad argument #1 (host object expected, got table)"
    );
}

#[test]
fn writes_reach_the_host_object() {
    let runtime = Runtime::new().unwrap();
    let map = Rc::new(HostMap::default());
    let list = Rc::new(HostList::new([Value::from("a")]));
    runtime.set_global("m", as_attrgetter(map.clone())).unwrap();
    runtime.set_global("l", as_itemgetter(list.clone())).unwrap();

    runtime
        .execute("m.colour = 'red' m.size = 3 m.size = nil l[0] = 'z' l[1] = 'b'", [])
        .unwrap();
    assert_eq!(map.get("colour"), Some(Value::from("red")));
    assert_eq!(map.get("size"), None);
    assert_eq!(list.to_vec(), vec![Value::from("z"), Value::from("b")]);

    assert_eq!(expect_error_message(&runtime, "l[5] = 1"), "list index 5 out of range");
    assert_eq!(runtime.eval("tostring(l)").unwrap(), Value::from("[z, b]"));
    assert_eq!(runtime.eval("l[9]").unwrap(), Value::Nil);
}

#[test]
fn host_values_come_back_as_the_same_object() {
    let runtime = Runtime::new().unwrap();
    let list = Rc::new(HostList::default());
    let identity = runtime.create_function(|_, args| Ok(args)).unwrap();
    let results = identity.call([Value::Host(as_itemgetter(list.clone()))]).unwrap();
    assert_eq!(results[0], Value::Host(Proxy::Item(list.clone())));
    assert_eq!(results[0].type_name(), "userdata");
}

#[test]
fn collected_proxies_release_the_host_object() {
    let tracer = RecordingTracer::new();
    let runtime = Runtime::with_tracer(BridgeConfig::default(), Box::new(tracer.clone())).unwrap();
    let list = Rc::new(HostList::default());
    runtime.set_global("l", as_itemgetter(list.clone())).unwrap();
    assert_eq!(Rc::strong_count(&list), 2);

    runtime.set_global("l", Value::Nil).unwrap();
    runtime.collect_garbage().unwrap();
    assert_eq!(Rc::strong_count(&list), 1);

    let proxy_events: Vec<TraceEvent> = tracer
        .events()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                TraceEvent::ProxyCreated { .. } | TraceEvent::ProxyFinalized { .. }
            )
        })
        .collect();
    assert_eq!(
        proxy_events,
        vec![
            TraceEvent::ProxyCreated { kind: ProxyKind::Item },
            TraceEvent::ProxyFinalized { kind: ProxyKind::Item },
        ]
    );
}

#[test]
fn closing_the_interpreter_releases_every_host_object() {
    let list = Rc::new(HostList::default());
    let captured = Rc::new(HostMap::default());
    {
        let runtime = Runtime::new().unwrap();
        runtime.set_global("l", as_itemgetter(list.clone())).unwrap();
        let held = captured.clone();
        let function = runtime
            .create_function(move |_, _| Ok(smallvec![Value::Integer(held.len() as i64)]))
            .unwrap();
        runtime.set_global("f", function).unwrap();
        assert_eq!(Rc::strong_count(&list), 2);
        assert_eq!(Rc::strong_count(&captured), 2);
    }
    assert_eq!(Rc::strong_count(&list), 1);
    assert_eq!(Rc::strong_count(&captured), 1);
}

#[test]
fn none_marker_reads_as_nil() {
    let runtime = Runtime::new().unwrap();
    assert_eq!(runtime.eval("host.none").unwrap(), Value::Nil);
    assert_eq!(runtime.eval("type(host.none)").unwrap(), Value::from("userdata"));
    assert_eq!(runtime.eval("host.none == host.none").unwrap(), Value::Boolean(true));
}

#[test]
fn host_objects_can_call_back_into_the_interpreter() {
    let runtime = Runtime::new().unwrap();
    let apply = Rc::new(HostFunction::named("apply", |lua, args| {
        let mut args = args.into_iter();
        let (Some(Value::Function(function)), Some(value)) = (args.next(), args.next()) else {
            return Err(BridgeError::host("apply(f, value)"));
        };
        let doubled = lua.arith(lupine::ArithOp::Mul, &value, &Value::Integer(2))?;
        function.call([doubled])
    }));
    runtime.set_global("apply", as_function(apply)).unwrap();
    assert_eq!(
        runtime.eval("apply(function(x) return x + 1 end, 20)").unwrap(),
        Value::Integer(41)
    );
}
