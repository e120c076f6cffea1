#![forbid(unsafe_code)]

//! Property-based model test for `ObservableSequence`.
//!
//! Random insert / update / delete scripts run against both the observable
//! sequence and a plain `Vec`. For every script:
//!
//! 1. Contents match the model after every step.
//! 2. Each mutation produces exactly one will/did pair with the same range.
//! 3. Insert ranges start at the insertion index and span the new elements.
//! 4. Update and delete ranges are the ranges passed in.
//! 5. `version` equals the number of mutations applied.

use std::cell::RefCell;
use std::ops::Range;
use std::rc::Rc;

use mcs_storage::{ObservableSequence, SequenceListener};
use proptest::prelude::*;

// ── Strategies ────────────────────────────────────────────────────────────

/// Operation with unresolved positions; resolved against the live length.
#[derive(Debug, Clone)]
enum RawOp {
    Insert { at: usize, values: Vec<u8> },
    Update { start: usize, span: usize, fill: u8 },
    Delete { start: usize, span: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Insert(usize, Vec<u8>),
    Update(Range<usize>, Vec<u8>),
    Delete(Range<usize>),
}

fn raw_op_strategy() -> impl Strategy<Value = RawOp> {
    prop_oneof![
        (any::<usize>(), proptest::collection::vec(any::<u8>(), 0..=4))
            .prop_map(|(at, values)| RawOp::Insert { at, values }),
        (any::<usize>(), any::<usize>(), any::<u8>())
            .prop_map(|(start, span, fill)| RawOp::Update { start, span, fill }),
        (any::<usize>(), any::<usize>()).prop_map(|(start, span)| RawOp::Delete { start, span }),
    ]
}

fn script_strategy(max_len: usize) -> impl Strategy<Value = (Vec<u8>, Vec<RawOp>)> {
    (
        proptest::collection::vec(any::<u8>(), 0..=8),
        proptest::collection::vec(raw_op_strategy(), 1..=max_len),
    )
}

fn resolve(raw: &RawOp, len: usize) -> Op {
    let range_at = |start: usize, span: usize| {
        let start = start % (len + 1);
        let end = start + span % (len - start + 1);
        start..end
    };
    match raw {
        RawOp::Insert { at, values } => Op::Insert(at % (len + 1), values.clone()),
        RawOp::Update { start, span, fill } => {
            let range = range_at(*start, *span);
            let values = vec![*fill; range.len()];
            Op::Update(range, values)
        }
        RawOp::Delete { start, span } => Op::Delete(range_at(*start, *span)),
    }
}

// ── Recorder ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Will(&'static str, Range<usize>),
    Did(&'static str, Range<usize>),
}

#[derive(Default)]
struct Recorder {
    events: RefCell<Vec<Event>>,
}

impl SequenceListener for Recorder {
    fn will_insert_range(&self, range: Range<usize>) {
        self.events.borrow_mut().push(Event::Will("insert", range));
    }
    fn did_insert_range(&self, range: Range<usize>) {
        self.events.borrow_mut().push(Event::Did("insert", range));
    }
    fn will_update_range(&self, range: Range<usize>) {
        self.events.borrow_mut().push(Event::Will("update", range));
    }
    fn did_update_range(&self, range: Range<usize>) {
        self.events.borrow_mut().push(Event::Did("update", range));
    }
    fn will_delete_range(&self, range: Range<usize>) {
        self.events.borrow_mut().push(Event::Will("delete", range));
    }
    fn did_delete_range(&self, range: Range<usize>) {
        self.events.borrow_mut().push(Event::Did("delete", range));
    }
}

/// Runs `ops` and returns (observed contents per step, model contents per
/// step, observed events, expected events, final version).
#[allow(clippy::type_complexity)]
fn run_script(
    initial: &[u8],
    ops: &[RawOp],
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>, Vec<Event>, Vec<Event>, u64) {
    let sequence = ObservableSequence::new(initial.to_vec());
    let recorder = Rc::new(Recorder::default());
    let key = sequence.register(&recorder);

    let mut model = initial.to_vec();
    let mut observed = Vec::new();
    let mut expected_contents = Vec::new();
    let mut expected_events = Vec::new();

    for raw in ops {
        match resolve(raw, model.len()) {
            Op::Insert(at, values) => {
                let range = at..at + values.len();
                expected_events.push(Event::Will("insert", range.clone()));
                expected_events.push(Event::Did("insert", range));
                sequence.insert(values.clone(), at);
                let tail = model.split_off(at);
                model.extend(values);
                model.extend(tail);
            }
            Op::Update(range, values) => {
                expected_events.push(Event::Will("update", range.clone()));
                expected_events.push(Event::Did("update", range.clone()));
                sequence.update(range.clone(), values.clone());
                model[range].copy_from_slice(&values);
            }
            Op::Delete(range) => {
                expected_events.push(Event::Will("delete", range.clone()));
                expected_events.push(Event::Did("delete", range.clone()));
                sequence.delete(range.clone());
                model.drain(range);
            }
        }
        observed.push(sequence.read());
        expected_contents.push(model.clone());
    }

    sequence.deregister(key);
    let events = recorder.events.borrow().clone();
    (
        observed,
        expected_contents,
        events,
        expected_events,
        sequence.version(),
    )
}

// 1-5. Contents, event pairing, ranges and version all follow the model.

proptest! {
    #[test]
    fn sequence_matches_vec_model((initial, ops) in script_strategy(24)) {
        let (observed, expected, events, expected_events, version) = run_script(&initial, &ops);
        prop_assert_eq!(observed, expected);
        prop_assert_eq!(events, expected_events);
        prop_assert_eq!(version, ops.len() as u64);
    }
}

// Reads from inside a handler see the pre-mutation length in `will_*` and
// the post-mutation length in `did_*`.

struct LengthWatcher {
    sequence: ObservableSequence<u8>,
    lengths: RefCell<Vec<(usize, usize)>>,
    pending: RefCell<Option<usize>>,
}

impl LengthWatcher {
    fn before(&self) {
        *self.pending.borrow_mut() = Some(self.sequence.len());
    }

    fn after(&self) {
        if let Some(before) = self.pending.borrow_mut().take() {
            self.lengths.borrow_mut().push((before, self.sequence.len()));
        }
    }
}

impl SequenceListener for LengthWatcher {
    fn will_insert_range(&self, _range: Range<usize>) {
        self.before();
    }
    fn did_insert_range(&self, _range: Range<usize>) {
        self.after();
    }
    fn will_update_range(&self, _range: Range<usize>) {
        self.before();
    }
    fn did_update_range(&self, _range: Range<usize>) {
        self.after();
    }
    fn will_delete_range(&self, _range: Range<usize>) {
        self.before();
    }
    fn did_delete_range(&self, _range: Range<usize>) {
        self.after();
    }
}

proptest! {
    #[test]
    fn handlers_see_lengths_either_side_of_the_change((initial, ops) in script_strategy(16)) {
        let sequence = ObservableSequence::new(initial.clone());
        let watcher = Rc::new(LengthWatcher {
            sequence: sequence.clone(),
            lengths: RefCell::new(Vec::new()),
            pending: RefCell::new(None),
        });
        let key = sequence.register(&watcher);

        let mut expected = Vec::new();
        let mut len = initial.len();
        for raw in &ops {
            let after = match resolve(raw, len) {
                Op::Insert(at, values) => {
                    let grown = len + values.len();
                    sequence.insert(values, at);
                    grown
                }
                Op::Update(range, values) => {
                    sequence.update(range, values);
                    len
                }
                Op::Delete(range) => {
                    let shrunk = len - range.len();
                    sequence.delete(range);
                    shrunk
                }
            };
            expected.push((len, after));
            len = after;
        }
        sequence.deregister(key);

        let lengths = watcher.lengths.borrow().clone();
        prop_assert_eq!(lengths, expected);
    }
}
