//! End-to-end runs of the JIT: warm a function up in the interpreter, enter its generated code,
//! and check what happens when a speculation turns out to be wrong.

mod common;

use common::{add, f, forward, runtime};
use jitrt::{
    bytecode::{Op, ScriptBuilder},
    options::JitOptions,
    oracle::ShapeCache,
    value::{Value, ValueType},
    BailoutKind, BailoutResult, JitState, RuntimeError,
};

#[test]
fn int_add_without_bailout() {
    let rt = runtime(vec![add("add")], JitOptions::default().with_hot_threshold(3));
    for _ in 0..2 {
        assert_eq!(rt.call(f(0), &[Value::Int32(1), Value::Int32(1)]), Ok(Value::Int32(2)));
    }
    assert_eq!(rt.call(f(0), &[Value::Int32(2), Value::Int32(3)]), Ok(Value::Int32(5)));
    assert_eq!(rt.function_state(f(0)), Some(JitState::Compiled));
    let counts = rt.stats().unwrap();
    assert_eq!(counts.jit_entries, 1);
    assert_eq!(counts.bailouts, 0);
    assert!(rt.last_bailout().is_none());
}

#[test]
fn overflow_bails_out_to_a_double() {
    let rt = runtime(vec![add("add")], JitOptions::default().with_hot_threshold(3));
    for i in 0..3 {
        rt.call(f(0), &[Value::Int32(i), Value::Int32(1)]).unwrap();
    }
    let code = rt.code_for(f(0)).unwrap();
    assert_eq!(
        rt.call(f(0), &[Value::Int32(i32::MAX), Value::Int32(1)]),
        Ok(Value::Double(2147483648.0))
    );
    let report = rt.last_bailout().unwrap();
    assert_eq!(report.func, f(0));
    assert_eq!(report.kind, BailoutKind::Overflow);
    assert_eq!(report.result, BailoutResult::ResumeNormal);
    // The interpreter redoes the add with both operands.
    assert_eq!(report.frames.len(), 1);
    let fr = &report.frames[0];
    assert_eq!(fr.pc, 2);
    assert_eq!(fr.args, [Value::Int32(i32::MAX), Value::Int32(1)]);
    assert_eq!(fr.stack, [Value::Int32(i32::MAX), Value::Int32(1)]);
    assert!(rt.observed(f(0), 2).contains(ValueType::Double));
    // The code can no longer be trusted to produce the add's result type.
    assert!(report.invalidated);
    assert!(code.is_invalidated());
    assert_eq!(rt.function_state(f(0)), Some(JitState::Counting(0)));

    // Once recompiled, the add no longer speculates on Int32.
    for _ in 0..3 {
        rt.call(f(0), &[Value::Int32(1), Value::Int32(1)]).unwrap();
    }
    assert_eq!(rt.compile_count(f(0)), 2);
    assert_eq!(
        rt.call(f(0), &[Value::Int32(i32::MAX), Value::Int32(2)]),
        Ok(Value::Double(2147483649.0))
    );
    assert_eq!(rt.stats().unwrap().bailouts, 1);
}

#[test]
fn type_barrier_widens_call_results() {
    // g(flag, s) = flag ? 1 : s
    let mut b = ScriptBuilder::new("g", 2, 0);
    let other = b.new_label();
    b.op(Op::GetArg(0));
    b.jump_if_false(other);
    b.ops(&[Op::Int(1), Op::Return]);
    b.bind(other);
    b.ops(&[Op::GetArg(1), Op::Return]);
    let g = b.build().unwrap();
    // f(flag, s) = g(flag, s) + 1
    let mut b = ScriptBuilder::new("f", 2, 0);
    b.ops(&[Op::GetArg(0), Op::GetArg(1)]);
    b.call(f(1), 2);
    b.ops(&[Op::Int(1), Op::Add, Op::Return]);
    let opts = JitOptions::default()
        .with_hot_threshold(3)
        .with_max_inline_depth(0);
    let rt = runtime(vec![b.build().unwrap(), g], opts);
    let s = rt.string("s");
    for _ in 0..3 {
        assert_eq!(rt.call(f(0), &[Value::Boolean(true), s]), Ok(Value::Int32(2)));
    }
    assert_eq!(rt.function_state(f(0)), Some(JitState::Compiled));
    assert_eq!(rt.observed(f(0), 2), jitrt::value::TypeSet::single(ValueType::Int32));

    let r = rt.call(f(0), &[Value::Boolean(false), s]).unwrap();
    assert_eq!(rt.display(r), "s1");
    let report = rt.last_bailout().unwrap();
    assert_eq!(report.func, f(0));
    assert_eq!(report.kind, BailoutKind::TypeBarrier);
    assert_eq!(report.result, BailoutResult::ResumeAfterTypeWiden);
    // Resumed just after the call, with its result on the stack.
    assert_eq!(report.frames.len(), 1);
    assert_eq!(report.frames[0].pc, 3);
    assert_eq!(report.frames[0].stack, [s]);
    assert!(report.widened);
    let observed = rt.observed(f(0), 2);
    assert!(observed.contains(ValueType::String) && observed.contains(ValueType::Int32));
    assert_eq!(rt.function_state(f(0)), Some(JitState::Counting(0)));

    // The recompiled code takes either result type without bailing out.
    for _ in 0..3 {
        rt.call(f(0), &[Value::Boolean(true), s]).unwrap();
    }
    assert_eq!(rt.compile_count(f(0)), 2);
    let bailouts = rt.stats().unwrap().bailouts;
    for flag in [false, true, false] {
        let r = rt.call(f(0), &[Value::Boolean(flag), s]).unwrap();
        assert_eq!(rt.display(r), if flag { "2" } else { "s1" });
    }
    assert_eq!(rt.stats().unwrap().bailouts, bailouts);
    assert_eq!(rt.function_state(f(0)), Some(JitState::Compiled));
}

#[test]
fn inlined_overflow_rebuilds_every_frame() {
    // f1(a, b) = f2(a, b); f2(a, b) = f3(a, b); f3(a, b) = a + b
    let scripts = vec![forward("f1", f(1)), forward("f2", f(2)), add("f3")];
    let rt = runtime(scripts, JitOptions::default().with_hot_threshold(3));
    for i in 0..3 {
        assert_eq!(rt.call(f(0), &[Value::Int32(i), Value::Int32(i)]), Ok(Value::Int32(2 * i)));
    }
    assert_eq!(rt.function_state(f(0)), Some(JitState::Compiled));
    // Inlined: the callees were only ever called by the interpreter.
    assert_eq!(rt.function_state(f(2)), Some(JitState::Counting(2)));

    assert_eq!(
        rt.call(f(0), &[Value::Int32(i32::MAX), Value::Int32(1)]),
        Ok(Value::Double(2147483648.0))
    );
    let report = rt.last_bailout().unwrap();
    assert_eq!(report.func, f(0));
    assert_eq!(report.kind, BailoutKind::Overflow);
    let frames = report
        .frames
        .iter()
        .map(|fr| (fr.func, fr.pc))
        .collect::<Vec<_>>();
    assert_eq!(frames, [(f(0), 2), (f(1), 2), (f(2), 2)]);
    for fr in &report.frames {
        assert_eq!(fr.args, [Value::Int32(i32::MAX), Value::Int32(1)]);
    }
    assert!(report.frames[0].stack.is_empty());
    assert!(report.frames[1].stack.is_empty());
    assert_eq!(report.frames[2].stack, [Value::Int32(i32::MAX), Value::Int32(1)]);
    // Each caller observed the double its callee returned.
    assert!(rt.observed(f(0), 2).contains(ValueType::Double));
    assert!(rt.observed(f(1), 2).contains(ValueType::Double));
}

#[test]
fn bailouts_that_cannot_fit_their_frames_are_fatal() {
    // f1(a, b) = f2(a, b); f2(a, b) = f3(a, b); f3(a, b) = a + b, with room for two frames.
    let scripts = vec![forward("f1", f(1)), forward("f2", f(2)), add("f3")];
    let opts = JitOptions::default()
        .with_hot_threshold(u32::MAX)
        .with_max_frames(2);
    let rt = runtime(scripts, opts);
    // Warm up the callees on their own: f1 itself would need three interpreter frames.
    for i in 0..3 {
        assert_eq!(rt.call(f(2), &[Value::Int32(i), Value::Int32(i)]), Ok(Value::Int32(2 * i)));
        assert_eq!(rt.call(f(1), &[Value::Int32(i), Value::Int32(i)]), Ok(Value::Int32(2 * i)));
    }
    assert_eq!(
        rt.call(f(0), &[Value::Int32(1), Value::Int32(1)]),
        Err(RuntimeError::StackOverflow)
    );
    rt.compile(f(0)).unwrap();
    let code = rt.code_for(f(0)).unwrap();
    // All three functions run in one generated frame.
    assert_eq!(rt.call(f(0), &[Value::Int32(3), Value::Int32(4)]), Ok(Value::Int32(7)));

    // The overflow guard's snapshot describes three frames.
    assert_eq!(
        rt.call(f(0), &[Value::Int32(i32::MAX), Value::Int32(1)]),
        Err(RuntimeError::OutOfMemory)
    );
    let report = rt.last_bailout().unwrap();
    assert_eq!(report.func, f(0));
    assert_eq!(report.kind, BailoutKind::Overflow);
    assert_eq!(report.result, BailoutResult::Fatal);
    assert!(report.frames.is_empty());
    assert!(!report.widened);
    assert!(report.invalidated);
    assert!(code.is_invalidated());
    assert_eq!(rt.function_state(f(0)), Some(JitState::DontCompile));
    assert!(rt.code_for(f(0)).is_none());
    assert!(rt.compile(f(0)).is_err());
    // Interpreted from now on, so the three frames are needed again.
    let entries = rt.stats().unwrap().jit_entries;
    assert_eq!(
        rt.call(f(0), &[Value::Int32(3), Value::Int32(4)]),
        Err(RuntimeError::StackOverflow)
    );
    assert_eq!(rt.stats().unwrap().jit_entries, entries);
}

#[test]
fn property_caches_hit_and_fall_back() {
    // get(o) = o.x
    let mut get = ScriptBuilder::new("get", 1, 0);
    get.op(Op::GetArg(0)).get_prop("x").op(Op::Return);
    // set(o, v) { o.x = v }
    let mut set = ScriptBuilder::new("set", 2, 0);
    set.ops(&[Op::GetArg(0), Op::GetArg(1)]).set_prop("x");
    set.ops(&[Op::Undefined, Op::Return]);
    // init(o) { o.x = 0 }
    let mut init = ScriptBuilder::new("init", 1, 0);
    init.ops(&[Op::GetArg(0), Op::Int(0)]).set_prop("x");
    init.ops(&[Op::Undefined, Op::Return]);
    let scripts = vec![get.build().unwrap(), set.build().unwrap(), init.build().unwrap()];
    let rt = runtime(scripts, JitOptions::default().with_hot_threshold(3));
    let (get, set, init) = (f(0), f(1), f(2));
    let p = rt.object("Point");
    rt.call(init, &[p]).unwrap();

    for v in 1..4 {
        rt.call(set, &[p, Value::Int32(v)]).unwrap();
        assert_eq!(rt.call(get, &[p]), Ok(Value::Int32(v)));
    }
    assert_eq!(rt.function_state(set), Some(JitState::Compiled));
    assert_eq!(rt.function_state(get), Some(JitState::Compiled));
    let ShapeCache::Mono { slot: Some(0), .. } = rt.property_cache(get, 1) else {
        panic!("{:?}", rt.property_cache(get, 1));
    };
    assert!(rt.code_for(get).unwrap().disassemble().contains("lea r15"));

    // Objects of the cached shape are accessed in place.
    let q = rt.object("Point");
    rt.call(init, &[q]).unwrap();
    rt.call(set, &[q, Value::Int32(7)]).unwrap();
    assert_eq!(rt.call(get, &[q]), Ok(Value::Int32(7)));
    assert_eq!(rt.call(get, &[p]), Ok(Value::Int32(3)));

    // Other shapes, and non-objects, go through the runtime without leaving generated code.
    let entries = rt.stats().unwrap().jit_entries;
    let other = rt.object("Other");
    rt.call(set, &[other, Value::Int32(8)]).unwrap();
    assert_eq!(rt.call(get, &[other]), Ok(Value::Int32(8)));
    rt.call(set, &[Value::Int32(1), Value::Int32(8)]).unwrap();
    assert_eq!(rt.stats().unwrap().jit_entries, entries + 3);
    assert_eq!(rt.stats().unwrap().bailouts, 0);
    assert!(rt.last_bailout().is_none());

    // A read of a missing property produces a type the cache's barrier did not expect.
    assert_eq!(rt.call(get, &[Value::Int32(1)]), Ok(Value::Undefined));
    let report = rt.last_bailout().unwrap();
    assert_eq!(report.func, get);
    assert_eq!(report.kind, BailoutKind::TypeBarrier);
    assert_eq!(report.frames[0].pc, 2);
    assert_eq!(report.frames[0].stack, [Value::Undefined]);
    assert!(rt.observed(get, 1).contains(ValueType::Undefined));
}

#[test]
fn functions_without_guards_have_no_snapshots() {
    let mut b = ScriptBuilder::new("seven", 0, 0);
    b.ops(&[Op::Int(7), Op::Return]);
    let rt = runtime(vec![b.build().unwrap()], JitOptions::default());
    rt.compile(f(0)).unwrap();
    let code = rt.code_for(f(0)).unwrap();
    assert_eq!(code.num_guards(), 0);
    assert!(code.snapshot_table().is_empty());
    assert_eq!(rt.call(f(0), &[]), Ok(Value::Int32(7)));
    assert_eq!(rt.stats().unwrap().bailouts, 0);
}

#[test]
fn missing_arguments_go_through_the_rectifier() {
    let rt = runtime(vec![add("add")], JitOptions::default().with_hot_threshold(1));
    let s = rt.string("x");
    // Compiled on its first call, with nothing observed yet.
    let r = rt.call(f(0), &[s]).unwrap();
    assert_eq!(rt.display(r), "xundefined");
    assert_eq!(rt.stats().unwrap().jit_entries, 1);
}
