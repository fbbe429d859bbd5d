//! Dispatcher semantics: handler ordering, forwarding, bubbling and
//! one-shot resumption.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rill_runtime::prelude::*;

const STATE: EffectId = EffectId(1);
const LOG: EffectId = EffectId(2);
const GET: OpId = OpId(0);
const PUT: OpId = OpId(1);

fn resume_with(value: i64) -> impl Fn(&mut Machine, &HandlerFrame, &Value, EffectRequest) -> Result<Outcome> + Send + Sync + 'static {
    move |m: &mut Machine, _: &HandlerFrame, _: &Value, req: EffectRequest| req.resume(m, Value::I64(value))
}

fn get(m: &Machine, h: Option<&FrameRef>) -> Outcome {
    m.perform(h, STATE, GET, ResumeKind::Tail, Value::Unit)
}

#[test]
fn test_innermost_handler_wins() {
    let outer_calls = Arc::new(AtomicUsize::new(0));
    let mut clauses = ClauseTable::new();
    let calls = Arc::clone(&outer_calls);
    let outer = clauses.register(move |m, _, _, req| {
        calls.fetch_add(1, Ordering::SeqCst);
        req.resume(m, Value::I64(1))
    });
    let inner = clauses.register(resume_with(2));
    let mut machine = Machine::new(clauses);

    let h1 = HandlerInstall::new(vec![FrameSpec::new(STATE, GET, ResumeKind::Tail, outer)]);
    let h2 = HandlerInstall::new(vec![FrameSpec::new(STATE, GET, ResumeKind::Tail, inner)]);

    let result = machine
        .run(None, |m, h| m.handle(h, h1, |m, h| m.handle(h, h2, |m, h| Ok(get(m, h)))))
        .unwrap();

    assert_eq!(result, Value::I64(2));
    assert_eq!(outer_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_unclaimed_request_is_forwarded_unchanged() {
    let seen = Arc::new(Mutex::new(None));
    let mut clauses = ClauseTable::new();
    let record = Arc::clone(&seen);
    let outer = clauses.register(move |m, _, _, req| {
        *record.lock() = Some((req.effect_id, req.op_id, req.resume_kind, req.payload.clone()));
        req.resume(m, Value::Unit)
    });
    let inner = clauses.register(resume_with(0));
    let mut machine = Machine::new(clauses);

    let h1 = HandlerInstall::new(vec![FrameSpec::new(LOG, PUT, ResumeKind::Resume, outer)]);
    // the inner handler claims a different operation only
    let h2 = HandlerInstall::new(vec![FrameSpec::new(STATE, GET, ResumeKind::Tail, inner)]);

    let result = machine
        .run(None, |m, h| {
            m.handle(h, h1, |m, h| {
                m.handle(h, h2, |m, h| {
                    m.perform(h, LOG, PUT, ResumeKind::Resume, Value::from("hello"))
                        .and_then(m, |_, _| Ok(Outcome::value("done")))
                })
            })
        })
        .unwrap();

    assert_eq!(result, Value::from("done"));
    assert_eq!(
        seen.lock().clone(),
        Some((LOG, PUT, ResumeKind::Resume, Value::from("hello")))
    );
}

#[test]
fn test_resume_kind_is_part_of_the_match() {
    let mut clauses = ClauseTable::new();
    let tail = clauses.register(resume_with(1));
    let mut machine = Machine::new(clauses);
    let install = HandlerInstall::new(vec![FrameSpec::new(STATE, GET, ResumeKind::Tail, tail)]);

    let err = machine
        .run(None, |m, h| {
            m.handle(h, install, |m, h| Ok(m.perform(h, STATE, GET, ResumeKind::Resume, Value::Unit)))
        })
        .unwrap_err();

    assert_eq!(
        err,
        RuntimeError::UnhandledEffect {
            effect_id: STATE,
            op_id: GET,
            resume_kind: ResumeKind::Resume,
        }
    );
}

#[test]
fn test_unhandled_at_program_boundary() {
    let mut machine = Machine::default();
    let err = machine.run(None, |m, h| Ok(get(m, h))).unwrap_err();
    assert!(matches!(err, RuntimeError::UnhandledEffect { effect_id: STATE, .. }));
}

#[test]
fn test_resumption_continues_after_the_perform() {
    let stages = Arc::new(Mutex::new(Vec::new()));
    let clause_calls = Arc::new(AtomicUsize::new(0));

    let mut clauses = ClauseTable::new();
    let calls = Arc::clone(&clause_calls);
    let clause = clauses.register(move |m, _, _, req| {
        let n = calls.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        req.resume(m, Value::I64(n * 10))
    });
    let mut machine = Machine::new(clauses);
    let install = HandlerInstall::new(vec![FrameSpec::new(STATE, GET, ResumeKind::Tail, clause)]);

    let (prefix, between, suffix) = (Arc::clone(&stages), Arc::clone(&stages), Arc::clone(&stages));
    let result = machine
        .run(None, |m, h| {
            m.handle(h, install, |m, h| {
                prefix.lock().push("prefix");
                let chain = h.cloned();
                get(m, h).and_then(m, move |m, first| {
                    between.lock().push("between");
                    get(m, chain.as_ref()).and_then(m, move |_, second| {
                        suffix.lock().push("suffix");
                        Ok(Outcome::value(first.as_i64().unwrap_or(0) + second.as_i64().unwrap_or(0)))
                    })
                })
            })
        })
        .unwrap();

    assert_eq!(result, Value::I64(30));
    assert_eq!(clause_calls.load(Ordering::SeqCst), 2);
    assert_eq!(*stages.lock(), ["prefix", "between", "suffix"]);
}

#[test]
fn test_external_resume_skips_the_prefix() {
    let before = Arc::new(AtomicUsize::new(0));
    let after = Arc::new(AtomicUsize::new(0));

    let mut clauses = ClauseTable::new();
    let log = clauses.register(resume_with(0));
    let mut machine = Machine::new(clauses);
    // Only `Log.put` is handled, so `State.get` leaves the handler.
    let install = HandlerInstall::new(vec![FrameSpec::new(LOG, PUT, ResumeKind::Tail, log)]);

    let (b, a) = (Arc::clone(&before), Arc::clone(&after));
    let bubbled = machine
        .handle(None, install, |m, h| {
            b.fetch_add(1, Ordering::SeqCst);
            get(m, h).and_then(m, move |_, v| {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::value(v.as_i64().unwrap_or(0) + 1))
            })
        })
        .unwrap();

    let request = match bubbled {
        Outcome::Request(request) => request,
        Outcome::Value(v) => panic!("expected a suspended request, got {v:?}"),
    };
    assert_eq!(before.load(Ordering::SeqCst), 1);
    assert_eq!(after.load(Ordering::SeqCst), 0);

    let out = request.resume(&mut machine, Value::I64(41)).unwrap();
    assert_eq!(out.into_value(), Some(Value::I64(42)));
    assert_eq!(before.load(Ordering::SeqCst), 1);
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[test]
fn test_clause_can_post_process_resumed_value() {
    let mut clauses = ClauseTable::new();
    let clause = clauses.register(|m, _, _, req| {
        req.resume(m, Value::I64(5))?
            .and_then(m, |_, v| Ok(Outcome::value(v.as_i64().unwrap_or(0) * 2)))
    });
    let mut machine = Machine::new(clauses);
    let install = HandlerInstall::new(vec![FrameSpec::new(STATE, GET, ResumeKind::Resume, clause)]);

    let result = machine
        .run(None, |m, h| {
            m.handle(h, install, |m, h| {
                m.perform(h, STATE, GET, ResumeKind::Resume, Value::Unit)
                    .and_then(m, |_, v| Ok(Outcome::value(v.as_i64().unwrap_or(0) + 1)))
            })
        })
        .unwrap();

    // (5 + 1) * 2
    assert_eq!(result, Value::I64(12));
}

#[test]
fn test_double_resume_is_rejected() {
    let second = Arc::new(Mutex::new(None));
    let mut clauses = ClauseTable::new();
    let slot = Arc::clone(&second);
    let clause = clauses.register(move |m, _, _, mut req| {
        let k = SharedContinuation::new(req.take_continuation());
        let first = k.resume(m, Value::I64(7))?;
        *slot.lock() = Some(k.resume(m, Value::I64(8)).map(|_| ()));
        Ok(first)
    });
    let mut machine = Machine::new(clauses);
    let install = HandlerInstall::new(vec![FrameSpec::new(STATE, GET, ResumeKind::Resume, clause)]);

    let result = machine
        .run(None, |m, h| {
            m.handle(h, install, |m, h| Ok(m.perform(h, STATE, GET, ResumeKind::Resume, Value::Unit)))
        })
        .unwrap();

    assert_eq!(result, Value::I64(7));
    assert_eq!(
        second.lock().clone(),
        Some(Err(RuntimeError::ContinuationAlreadyResumed))
    );
}

#[test]
fn test_finally_runs_once_on_completion() {
    let finals = Arc::new(AtomicUsize::new(0));
    let mut clauses = ClauseTable::new();
    let clause = clauses.register(resume_with(3));
    let mut machine = Machine::new(clauses);
    let count = Arc::clone(&finals);
    let install = HandlerInstall::new(vec![FrameSpec::new(STATE, GET, ResumeKind::Tail, clause)]).with_finally(
        move |_, v| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(Value::I64(v.as_i64().unwrap_or(0) + 10))
        },
    );

    let result = machine
        .run(None, |m, h| {
            m.handle(h, install, |m, h| {
                get(m, h).and_then(m, |_, v| Ok(Outcome::Value(v)))
            })
        })
        .unwrap();

    assert_eq!(result, Value::I64(13));
    assert_eq!(finals.load(Ordering::SeqCst), 1);
}

#[test]
fn test_bubbled_continuation_reenters_inner_handler() {
    let finals = Arc::new(AtomicUsize::new(0));
    let mut clauses = ClauseTable::new();
    let state = clauses.register(resume_with(32));
    let mut machine = Machine::new(clauses);

    let count = Arc::clone(&finals);
    let install = HandlerInstall::new(vec![FrameSpec::new(STATE, GET, ResumeKind::Tail, state)]).with_finally(
        move |_, v| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(v)
        },
    );

    let bubbled = machine
        .handle(None, install, |m, h| {
            let chain = h.cloned();
            m.perform(h, LOG, PUT, ResumeKind::Tail, Value::Unit).and_then(m, move |m, logged| {
                let base = logged.as_i64().unwrap_or(0);
                get(m, chain.as_ref()).and_then(m, move |_, v| Ok(Outcome::value(base + v.as_i64().unwrap_or(0))))
            })
        })
        .unwrap();

    let request = match bubbled {
        Outcome::Request(request) => request,
        Outcome::Value(v) => panic!("expected a bubbled request, got {v:?}"),
    };
    assert_eq!((request.effect_id, request.op_id), (LOG, PUT));
    assert_eq!(finals.load(Ordering::SeqCst), 0);

    // Resuming from outside the handler must still route the next
    // perform to the inner handler and run its finalizer.
    let out = request.resume(&mut machine, Value::I64(10)).unwrap();
    assert_eq!(out.into_value(), Some(Value::I64(42)));
    assert_eq!(finals.load(Ordering::SeqCst), 1);
    assert_eq!(machine.stats().bubbled, 1);
}
