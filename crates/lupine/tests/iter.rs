use std::{cell::Cell, rc::Rc};

use lupine::{
    BridgeError, HostIter, HostList, HostMap, HostObject, HostTuple, Lua, MultiValue, Runtime, Value, as_itemgetter,
    smallvec,
};
use pretty_assertions::assert_eq;

/// Yields `0..limit`, failing on `fail_at`, and counts how often it was polled.
struct Counter {
    limit: i64,
    fail_at: Option<i64>,
    polls: Rc<Cell<usize>>,
}

impl HostObject for Counter {
    fn type_name(&self) -> &'static str {
        "Counter"
    }

    fn iter(&self, _lua: &Lua) -> Result<HostIter, BridgeError> {
        let (limit, fail_at, polls) = (self.limit, self.fail_at, self.polls.clone());
        let mut next = 0;
        Ok(Box::new(std::iter::from_fn(move || {
            polls.set(polls.get() + 1);
            if next >= limit {
                return None;
            }
            let current = next;
            next += 1;
            if Some(current) == fail_at {
                Some(Err(BridgeError::host(format!("counter failed at {current}"))))
            } else {
                Some(Ok(smallvec![Value::Integer(current)]))
            }
        })))
    }
}

/// Yields fixed tuples, including empty ones and ones starting with nil.
struct Rows(Vec<MultiValue>);

impl HostObject for Rows {
    fn iter(&self, _lua: &Lua) -> Result<HostIter, BridgeError> {
        Ok(Box::new(self.0.clone().into_iter().map(Ok)))
    }
}

fn letters() -> Rc<HostList> {
    Rc::new(HostList::new(["a", "b", "c"].map(Value::from)))
}

#[test]
fn enumerate_pairs_items_with_indices() {
    let runtime = Runtime::new().unwrap();
    runtime.set_global("xs", as_itemgetter(letters())).unwrap();
    let joined = runtime
        .eval(
            "(function() local out = {} for i, x in host.enumerate(xs) do out[#out + 1] = i .. '=' .. x end \
             return table.concat(out, ',') end)()",
        )
        .unwrap();
    assert_eq!(joined, Value::from("0=a,1=b,2=c"));
}

#[test]
fn exhausted_adapters_stay_exhausted() {
    let runtime = Runtime::new().unwrap();
    let polls = Rc::new(Cell::new(0));
    runtime
        .set_global(
            "c",
            Value::host(Counter {
                limit: 3,
                fail_at: None,
                polls: polls.clone(),
            }),
        )
        .unwrap();

    let results = runtime
        .execute(
            "local f, s = host.enumerate(c) \
             local a, b, c2 = f(s), f(s), f(s) \
             return select('#', f(s)), select('#', f(s)), a, c2",
            [],
        )
        .unwrap();
    assert_eq!(
        results.as_slice(),
        &[Value::Integer(0), Value::Integer(0), Value::Integer(0), Value::Integer(2)]
    );
    // three items plus the single poll that found the end
    assert_eq!(polls.get(), 4);
}

#[test]
fn enumerate_accepts_a_start_index() {
    let runtime = Runtime::new().unwrap();
    runtime.set_global("xs", as_itemgetter(letters())).unwrap();
    let results = runtime
        .execute("local out = {} for i, x in host.enumerate(xs, 1) do out[i] = x end return #out, out[3]", [])
        .unwrap();
    assert_eq!(results.as_slice(), &[Value::Integer(3), Value::from("c")]);

    let results = runtime
        .execute("local ok, e = pcall(host.enumerate, xs, 'one') return ok", [])
        .unwrap();
    assert_eq!(results[0], Value::Boolean(false));
}

#[test]
fn iterex_exposes_whole_tuples() {
    let runtime = Runtime::new().unwrap();
    let map = HostMap::new([("x", Value::Integer(1)), ("y", Value::Integer(2))]);
    runtime.set_global("m", Value::host(map)).unwrap();
    let joined = runtime
        .eval(
            "(function() local out = {} for k, v in host.iterex(m) do out[#out + 1] = k .. v end \
             return table.concat(out, ' ') end)()",
        )
        .unwrap();
    assert_eq!(joined, Value::from("x1 y2"));
}

#[test]
fn iter_packs_tuples_into_one_value() {
    let runtime = Runtime::new().unwrap();
    let map = HostMap::new([("x", Value::Integer(1))]);
    runtime.set_global("m", Value::host(map)).unwrap();
    let results = runtime
        .execute("for pair in host.iter(m) do return pair[0], pair[1], tostring(pair) end", [])
        .unwrap();
    assert_eq!(
        results.as_slice(),
        &[Value::from("x"), Value::Integer(1), Value::from("(x, 1)")]
    );

    let pair = runtime.eval("host.iter(m)(select(2, host.iter(m)))").unwrap();
    assert_eq!(
        pair.downcast_host::<HostTuple>().map(HostTuple::values),
        Some([Value::from("x"), Value::Integer(1)].as_slice())
    );
}

#[test]
fn nil_items_do_not_end_the_loop() {
    let runtime = Runtime::new().unwrap();
    let list = HostList::new([Value::Integer(1), Value::Nil, Value::Integer(3)]);
    runtime.set_global("l", Value::host(list)).unwrap();
    let results = runtime
        .execute(
            "local seen, nones = 0, 0 \
             for x in host.iter(l) do seen = seen + 1 if x == host.none then nones = nones + 1 end end \
             return seen, nones",
            [],
        )
        .unwrap();
    assert_eq!(results.as_slice(), &[Value::Integer(3), Value::Integer(1)]);
}

#[test]
fn extended_steps_pad_and_mark_nil() {
    let runtime = Runtime::new().unwrap();
    let rows = Rows(vec![
        smallvec![Value::Nil, Value::Integer(1)],
        smallvec![],
        smallvec![Value::from("last")],
    ]);
    runtime.set_global("rows", Value::host(rows)).unwrap();
    let results = runtime
        .execute(
            "local out = {} \
             for a, b in host.iterex(rows) do \
                 out[#out + 1] = (a == host.none and 'none' or tostring(a)) .. '/' .. tostring(b) \
             end \
             return table.concat(out, ' ')",
            [],
        )
        .unwrap();
    assert_eq!(results[0], Value::from("none/1 none/nil last/nil"));
}

#[test]
fn iterator_errors_propagate_and_do_not_exhaust() {
    let runtime = Runtime::new().unwrap();
    let polls = Rc::new(Cell::new(0));
    runtime
        .set_global(
            "c",
            Value::host(Counter {
                limit: 3,
                fail_at: Some(1),
                polls,
            }),
        )
        .unwrap();

    let results = runtime
        .execute(
            "local f, s = host.iter(c) \
             local first = f(s) \
             local ok, e = pcall(f, s) \
             local third = f(s) \
             return first, ok, e.message, third",
            [],
        )
        .unwrap();
    assert_eq!(
        results.as_slice(),
        &[
            Value::Integer(0),
            Value::Boolean(false),
            Value::from("counter failed at 1"),
            Value::Integer(2),
        ]
    );

    let error = runtime.execute("for _ in host.iter(c) do end", []).unwrap_err();
    assert_eq!(error.to_string(), "counter failed at 1");
}

#[test]
fn iteration_sees_a_snapshot_of_the_list() {
    let runtime = Runtime::new().unwrap();
    let list = letters();
    runtime.set_global("xs", as_itemgetter(list.clone())).unwrap();
    let length = runtime
        .eval("(function() for x in host.iter(xs) do xs[#xs] = x end return #xs end)()")
        .unwrap();
    assert_eq!(length, Value::Integer(6));
    assert_eq!(list.len(), 6);

    let count = runtime
        .eval("(function() local n = 0 for _, x in pairs(xs) do xs[#xs] = x n = n + 1 end return n end)()")
        .unwrap();
    assert_eq!(count, Value::Integer(6));
    assert_eq!(list.len(), 12);
}

#[test]
fn iterator_next_rejects_foreign_state() {
    let runtime = Runtime::new().unwrap();
    runtime.set_global("xs", as_itemgetter(letters())).unwrap();
    let results = runtime
        .execute("local f = host.iter(xs) local ok, e = pcall(f, {}) return ok, e.message", [])
        .unwrap();
    assert_eq!(
        results.as_slice(),
        &[Value::Boolean(false), Value::from("bad argument #1 (iterator expected)")]
    );
}
