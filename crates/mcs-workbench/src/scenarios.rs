#![forbid(unsafe_code)]

//! Workbench scenarios.
//!
//! Each scenario drives containers through a complete register / mutate /
//! deregister cycle and reports a [`ScenarioError`] when an observation does
//! not match. Scenarios marked `crashes` deliberately break the usage
//! protocol and are expected to terminate the process.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use mcs_storage::{
    CompletionQueue, ListenerKey, ObservableSequence, ObservableValue, SequenceListener,
    SerialQueue, StorageConfig, ValueListener,
};
use tracing::info;

/// An observation that did not match what the scenario expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioError {
    pub scenario: &'static str,
    pub message: String,
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scenario `{}` failed: {}", self.scenario, self.message)
    }
}

impl std::error::Error for ScenarioError {}

type Outcome = Result<(), ScenarioError>;

pub struct Scenario {
    pub name: &'static str,
    pub summary: &'static str,
    pub crashes: bool,
    run: fn(&StorageConfig) -> Outcome,
}

impl Scenario {
    pub fn run(&self, config: &StorageConfig) -> Outcome {
        (self.run)(config)
    }
}

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "did-set-closure",
        summary: "closure listener observes a write",
        crashes: false,
        run: did_set_closure,
    },
    Scenario {
        name: "delegate-markers",
        summary: "one listener in both sets sees will then did",
        crashes: false,
        run: delegate_markers,
    },
    Scenario {
        name: "staged-registry",
        summary: "registry changes made from handlers apply after the pass",
        crashes: false,
        run: staged_registry,
    },
    Scenario {
        name: "sequence-script",
        summary: "insert, update and delete report their ranges",
        crashes: false,
        run: sequence_script,
    },
    Scenario {
        name: "completion-fifo",
        summary: "completion callbacks fire once in enqueue order",
        crashes: false,
        run: completion_fifo,
    },
    Scenario {
        name: "serial-queue",
        summary: "a value bound to a serial queue notifies on that queue",
        crashes: false,
        run: serial_queue,
    },
    Scenario {
        name: "queue-outside-pass",
        summary: "staging a deregistration with no pass running is fatal",
        crashes: true,
        run: queue_outside_pass,
    },
    Scenario {
        name: "write-from-handler",
        summary: "writing a value from its own handler is fatal",
        crashes: true,
        run: write_from_handler,
    },
];

#[must_use]
pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

fn expect_eq<T: PartialEq + fmt::Debug>(
    scenario: &'static str,
    what: &str,
    actual: T,
    expected: T,
) -> Outcome {
    if actual == expected {
        Ok(())
    } else {
        Err(ScenarioError {
            scenario,
            message: format!("{what}: expected {expected:?}, got {actual:?}"),
        })
    }
}

// ============================================================================
// Scenarios
// ============================================================================

fn did_set_closure(config: &StorageConfig) -> Outcome {
    let v = ObservableValue::with_config(111, config.clone());
    let ok = Rc::new(Cell::new(false));
    let listener = {
        let ok = Rc::clone(&ok);
        Rc::new(move || ok.set(true))
    };
    let key = v.register_did_set(&listener);
    v.write(222);
    v.deregister_did_set(key);
    expect_eq("did-set-closure", "listener fired", ok.get(), true)
}

struct Markers(RefCell<Vec<char>>);

impl ValueListener for Markers {
    fn will_set(&self) {
        info!(marker = "A", "will_set");
        self.0.borrow_mut().push('A');
    }
    fn did_set(&self) {
        info!(marker = "B", "did_set");
        self.0.borrow_mut().push('B');
    }
}

fn delegate_markers(config: &StorageConfig) -> Outcome {
    let v = ObservableValue::with_config(111, config.clone());
    let markers = Rc::new(Markers(RefCell::new(Vec::new())));
    let key = v.register(&markers);
    v.write(222);
    v.deregister(key);
    let seen = markers.0.borrow().clone();
    expect_eq("delegate-markers", "markers", seen, vec!['A', 'B'])
}

struct StagedOnce {
    value: ObservableValue<i32>,
    records: Rc<RefCell<Vec<i32>>>,
}

impl ValueListener for StagedOnce {
    fn did_set(&self) {
        self.records.borrow_mut().push(1);
        self.value
            .queue_deregister_did_set(ListenerKey::of_ref(self));
    }
}

fn staged_registry(config: &StorageConfig) -> Outcome {
    const NAME: &str = "staged-registry";
    let records = Rc::new(RefCell::new(Vec::new()));
    let v = ObservableValue::with_config(111, config.clone());

    let once = Rc::new(StagedOnce {
        value: v.clone(),
        records: Rc::clone(&records),
    });
    v.register_did_set(&once);
    v.write(222);
    expect_eq(NAME, "after first write", records.borrow().clone(), vec![1])?;
    v.write(333);
    expect_eq(NAME, "after second write", records.borrow().clone(), vec![1])?;

    let third = {
        let records = Rc::clone(&records);
        Rc::new(move || records.borrow_mut().push(3))
    };
    let second = {
        let records = Rc::clone(&records);
        let v = v.clone();
        let third = Rc::clone(&third);
        Rc::new(move || {
            records.borrow_mut().push(2);
            v.queue_register_will_set(&third);
        })
    };
    let second_key = v.register_did_set(&second);
    v.write(444);
    expect_eq(NAME, "after staged registration", records.borrow().clone(), vec![1, 2])?;

    v.deregister_did_set(second_key);
    v.write(555);
    expect_eq(NAME, "after fifth write", records.borrow().clone(), vec![1, 2, 3])?;

    v.deregister_will_set(ListenerKey::of(&third));
    Ok(())
}

#[derive(Default)]
struct RangeLog(RefCell<Vec<String>>);

impl RangeLog {
    fn push(&self, event: &str, range: Range<usize>) {
        self.0.borrow_mut().push(format!("{event}{range:?}"));
    }
}

impl SequenceListener for RangeLog {
    fn will_insert_range(&self, range: Range<usize>) {
        self.push("will_insert", range);
    }
    fn did_insert_range(&self, range: Range<usize>) {
        self.push("did_insert", range);
    }
    fn will_update_range(&self, range: Range<usize>) {
        self.push("will_update", range);
    }
    fn did_update_range(&self, range: Range<usize>) {
        self.push("did_update", range);
    }
    fn will_delete_range(&self, range: Range<usize>) {
        self.push("will_delete", range);
    }
    fn did_delete_range(&self, range: Range<usize>) {
        self.push("did_delete", range);
    }
}

fn sequence_script(config: &StorageConfig) -> Outcome {
    const NAME: &str = "sequence-script";
    let s = ObservableSequence::with_config(vec!['x', 'y', 'z'], config.clone());
    let log = Rc::new(RangeLog::default());
    let key = s.register(&log);

    s.insert(['a', 'b'], 1);
    let after_insert = s.read();
    s.update(1..3, ['p', 'q']);
    let after_update = s.read();
    s.delete(1..3);
    let after_delete = s.read();
    s.deregister(key);

    expect_eq(NAME, "insert", after_insert, vec!['x', 'a', 'b', 'y', 'z'])?;
    expect_eq(NAME, "update", after_update, vec!['x', 'p', 'q', 'y', 'z'])?;
    expect_eq(NAME, "delete", after_delete, vec!['x', 'y', 'z'])?;
    let events = log.0.borrow().clone();
    expect_eq(
        NAME,
        "events",
        events,
        vec![
            "will_insert1..3".to_string(),
            "did_insert1..3".into(),
            "will_update1..3".into(),
            "did_update1..3".into(),
            "will_delete1..3".into(),
            "did_delete1..3".into(),
        ],
    )
}

fn completion_fifo(config: &StorageConfig) -> Outcome {
    let queue = CompletionQueue::with_config(config);
    let order = Rc::new(RefCell::new(Vec::new()));
    let producer = queue.channel();
    for step in ["fetch", "parse", "render"] {
        let order = Rc::clone(&order);
        producer.enqueue(move |status: &&str| order.borrow_mut().push(format!("{step}:{status}")));
    }
    queue.cast("done");
    let seen = order.borrow().clone();
    expect_eq(
        "completion-fifo",
        "order",
        seen,
        vec![
            "fetch:done".to_string(),
            "parse:done".into(),
            "render:done".into(),
        ],
    )
}

fn serial_queue(config: &StorageConfig) -> Outcome {
    const NAME: &str = "serial-queue";
    let queue = SerialQueue::spawn("mcs-workbench").map_err(|err| ScenarioError {
        scenario: NAME,
        message: format!("could not start queue: {err}"),
    })?;
    let expected = queue.context();
    let config = config.clone();
    let seen = queue
        .dispatch_sync(move || {
            let v = ObservableValue::with_config(0u32, config);
            let contexts = Rc::new(RefCell::new(Vec::new()));
            let listener = {
                let contexts = Rc::clone(&contexts);
                Rc::new(move || contexts.borrow_mut().push(mcs_storage::current_context()))
            };
            let key = v.register_did_set(&listener);
            v.write(1);
            v.write(2);
            v.deregister_did_set(key);
            let seen = contexts.borrow().clone();
            seen
        })
        .map_err(|err| ScenarioError {
            scenario: NAME,
            message: err.to_string(),
        })?;
    queue.shutdown();
    expect_eq(NAME, "listener contexts", seen, vec![expected, expected])
}

fn queue_outside_pass(config: &StorageConfig) -> Outcome {
    let v = ObservableValue::with_config(0, config.clone());
    let listener = Rc::new(|| {});
    v.register_did_set(&listener);
    v.queue_deregister_did_set(ListenerKey::of(&listener));
    Err(ScenarioError {
        scenario: "queue-outside-pass",
        message: "usage violation was not detected".into(),
    })
}

struct Rewriter(ObservableValue<i32>);

impl ValueListener for Rewriter {
    fn did_set(&self) {
        self.0.write(0);
    }
}

fn write_from_handler(config: &StorageConfig) -> Outcome {
    let v = ObservableValue::with_config(0, config.clone());
    let rewriter = Rc::new(Rewriter(v.clone()));
    v.register_did_set(&rewriter);
    v.write(1);
    Err(ScenarioError {
        scenario: "write-from-handler",
        message: "usage violation was not detected".into(),
    })
}
