#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use ptg::{
    config::{Config, QueuePolicy, RuntimeConfig},
    context::ExecutionContext,
    distribution::{CyclicGrid, SingleRank},
    executor::{Executor, ExecutorError},
    expr::Expr,
    registry::Registry,
    remote::{NullTransport, Transport},
    scheduler::{ReadyTask, TaskBody, TaskStatus},
    symbol::Symbol,
    task_class::{Access, Binding, Dep, Flow, TaskClassBuilder},
    taskpool::Taskpool,
    types::{LocalValue, Rank},
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

const NT: LocalValue = 5;
const POTRF: u16 = 0;
const TRSM: u16 = 1;
const SYRK: u16 = 2;
const GEMM: u16 = 3;

fn l(index: usize) -> Expr {
    Expr::local(index)
}

fn at(bindings: impl IntoIterator<Item = Expr>) -> Vec<Binding> {
    bindings.into_iter().map(Binding::value).collect()
}

/// Tiled lower Cholesky factorization of an `nt × nt` tile matrix, with
/// `keep` as the predicate of every class.
///
/// `POTRF(k)`, `TRSM(k, m)`, `SYRK(k, m)`, `GEMM(k, m, n)`.
fn cholesky(nt: LocalValue, keep: impl Fn(u16) -> Option<Expr>) -> Registry {
    let with_keep = |builder: TaskClassBuilder, id: u16| match keep(id) {
        Some(predicate) => builder.predicate(predicate),
        None => builder,
    };
    let mut registry = Registry::new();

    let potrf = TaskClassBuilder::new("POTRF")
        .local(Symbol::new("k", 0, nt - 1))
        .flow(
            Flow::new("T", Access::InOut)
                .input(Dep::collection("descA").when(l(0).equals(0)))
                .input(Dep::task(SYRK, 1, at([l(0) - 1, l(0)])).when(l(0).gt(0)))
                .output(
                    Dep::task(TRSM, 0, vec![Binding::value(l(0)), Binding::range(l(0) + 1, nt - 1)])
                        .when(l(0).lt(nt - 1)),
                )
                .output(Dep::collection("descA")),
        );
    registry.register(with_keep(potrf, POTRF)).unwrap();

    let trsm = TaskClassBuilder::new("TRSM")
        .local(Symbol::new("k", 0, nt - 2))
        .local(Symbol::new("m", l(0) + 1, nt - 1))
        .flow(Flow::new("T", Access::In).input(Dep::task(POTRF, 0, at([l(0)]))))
        .flow(
            Flow::new("C", Access::InOut)
                .input(Dep::collection("descA").when(l(0).equals(0)))
                .input(Dep::task(GEMM, 2, at([l(0) - 1, l(1), l(0)])).when(l(0).gt(0)))
                .output(Dep::task(SYRK, 0, at([l(0), l(1)])))
                .output(Dep::task(
                    GEMM,
                    0,
                    vec![
                        Binding::value(l(0)),
                        Binding::value(l(1)),
                        Binding::range(l(0) + 1, l(1) - 1),
                    ],
                ))
                .output(Dep::task(
                    GEMM,
                    1,
                    vec![
                        Binding::value(l(0)),
                        Binding::range(l(1) + 1, nt - 1),
                        Binding::value(l(1)),
                    ],
                ))
                .output(Dep::collection("descA")),
        );
    registry.register(with_keep(trsm, TRSM)).unwrap();

    let syrk = TaskClassBuilder::new("SYRK")
        .local(Symbol::new("k", 0, nt - 2))
        .local(Symbol::new("m", l(0) + 1, nt - 1))
        .flow(Flow::new("A", Access::In).input(Dep::task(TRSM, 1, at([l(0), l(1)]))))
        .flow(
            Flow::new("T", Access::InOut)
                .input(Dep::collection("descA").when(l(0).equals(0)))
                .input(Dep::task(SYRK, 1, at([l(0) - 1, l(1)])).when(l(0).gt(0)))
                .output(Dep::task(POTRF, 0, at([l(1)])).when(l(1).equals(l(0) + 1)))
                .output(Dep::task(SYRK, 1, at([l(0) + 1, l(1)])).when(l(1).gt(l(0) + 1))),
        );
    registry.register(with_keep(syrk, SYRK)).unwrap();

    let gemm = TaskClassBuilder::new("GEMM")
        .local(Symbol::new("k", 0, nt - 3))
        .local(Symbol::new("m", l(0) + 2, nt - 1))
        .local(Symbol::new("n", l(0) + 1, l(1) - 1))
        .flow(Flow::new("A", Access::In).input(Dep::task(TRSM, 1, at([l(0), l(1)]))))
        .flow(Flow::new("B", Access::In).input(Dep::task(TRSM, 1, at([l(0), l(2)]))))
        .flow(
            Flow::new("C", Access::InOut)
                .input(Dep::collection("descA").when(l(0).equals(0)))
                .input(Dep::task(GEMM, 2, at([l(0) - 1, l(1), l(2)])).when(l(0).gt(0)))
                .output(Dep::task(TRSM, 1, at([l(2), l(1)])).when(l(2).equals(l(0) + 1)))
                .output(Dep::task(GEMM, 2, at([l(0) + 1, l(1), l(2)])).when(l(2).gt(l(0) + 1))),
        );
    registry.register(with_keep(gemm, GEMM)).unwrap();
    registry
}

/// Instances of the factorization of `nt` tiles.
fn expected_count(nt: LocalValue) -> usize {
    let nt = usize::try_from(nt).unwrap();
    nt + nt * (nt - 1) + nt * (nt - 1) * (nt - 2) / 6
}

type Log = Arc<Mutex<Vec<(Rank, String)>>>;

#[derive(Clone, Default)]
struct Recorder {
    rank: Rank,
    log: Log,
    fail_on: Option<String>,
}

impl TaskBody for Recorder {
    fn execute(&self, task: &ExecutionContext<'_>) -> TaskStatus {
        let name = task.to_string();
        if self.fail_on.as_ref() == Some(&name) {
            return TaskStatus::Failed;
        }
        self.log.lock().unwrap().push((self.rank, name));
        TaskStatus::Done
    }
}

struct Local;

impl Config for Local {
    type Distribution = SingleRank;
    type Transport = NullTransport;
    type Body = Recorder;
}

fn local_pool(policy: QueuePolicy) -> Taskpool<Local> {
    let config = RuntimeConfig {
        nb_workers: 4,
        queue_policy: policy,
        ..RuntimeConfig::default()
    };
    Taskpool::new(Arc::new(cholesky(NT, |_| None)), config, SingleRank, NullTransport).unwrap()
}

/// Every instance ran exactly once, after the instances it reads from.
fn check_log(log: &[(Rank, String)]) {
    let mut position = HashMap::new();
    for (index, (_, name)) in log.iter().enumerate() {
        assert!(position.insert(name.clone(), index).is_none(), "{name} ran twice");
    }
    assert_eq!(position.len(), expected_count(NT));
    let before = |first: String, second: String| {
        assert!(position[&first] < position[&second], "{first} must run before {second}");
    };
    for k in 0..NT {
        if k > 0 {
            before(format!("SYRK_{}_{k}", k - 1), format!("POTRF_{k}"));
        }
        for m in k + 1..NT {
            before(format!("POTRF_{k}"), format!("TRSM_{k}_{m}"));
            before(format!("TRSM_{k}_{m}"), format!("SYRK_{k}_{m}"));
            for n in k + 1..m {
                before(format!("TRSM_{k}_{m}"), format!("GEMM_{k}_{m}_{n}"));
                before(format!("TRSM_{k}_{n}"), format!("GEMM_{k}_{m}_{n}"));
                if n == k + 1 {
                    before(format!("GEMM_{k}_{m}_{n}"), format!("TRSM_{n}_{m}"));
                }
            }
        }
    }
}

#[test]
fn cholesky_runs_every_task_once() {
    for policy in [QueuePolicy::Lifo, QueuePolicy::Fifo] {
        let pool = local_pool(policy);
        let recorder = Recorder::default();
        let report = Executor::new(&pool, recorder.clone()).run().unwrap();
        assert_eq!(report.total_executed(), expected_count(NT));
        assert_eq!(report.executed.len(), 4);
        assert_eq!(report.activations, 0);
        check_log(&recorder.log.lock().unwrap());
        assert!(pool.is_quiescent());
    }
}

#[test]
fn failing_task_aborts_the_run() {
    let pool = local_pool(QueuePolicy::Lifo);
    let recorder = Recorder {
        fail_on: Some("TRSM_0_2".to_owned()),
        ..Recorder::default()
    };
    let result = Executor::new(&pool, recorder.clone()).run();
    assert_eq!(
        result,
        Err(ExecutorError::TaskFailed {
            task: "TRSM_0_2".to_owned()
        })
    );
    let log = recorder.log.lock().unwrap();
    assert!(log.iter().all(|(_, name)| name != "SYRK_0_2"));
}

#[derive(Clone, Default)]
struct Mailbox(Arc<Mutex<Vec<(Rank, Vec<u8>)>>>);

impl Mailbox {
    fn drain(&self) -> Vec<(Rank, Vec<u8>)> {
        core::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl Transport for Mailbox {
    fn send_activation(&self, rank: Rank, message: &[u8]) {
        self.0.lock().unwrap().push((rank, message.to_vec()));
    }
}

struct Distributed;

impl Config for Distributed {
    type Distribution = CyclicGrid;
    type Transport = Mailbox;
    type Body = Recorder;
}

/// Column-cyclic ownership over two ranks: a tile belongs to `m mod 2`.
fn column_cyclic() -> CyclicGrid {
    CyclicGrid::new(vec![2])
        .with_coordinates(TRSM, vec![l(1)])
        .with_coordinates(SYRK, vec![l(1)])
        .with_coordinates(GEMM, vec![l(1)])
}

fn rank_pool(rank: Rank) -> Taskpool<Distributed> {
    let column = |id| if id == POTRF { l(0) } else { l(1) };
    let registry = cholesky(NT, |id| Some((column(id) % 2).equals(LocalValue::try_from(rank).unwrap())));
    let config = RuntimeConfig {
        rank,
        nb_ranks: 2,
        nb_workers: 2,
        ..RuntimeConfig::default()
    };
    Taskpool::new(Arc::new(registry), config, column_cyclic(), Mailbox::default()).unwrap()
}

#[test]
fn two_ranks_exchange_activations_between_phases() {
    let pools = [rank_pool(0), rank_pool(1)];
    let log = Log::default();
    let executors: Vec<_> = pools
        .iter()
        .map(|pool| {
            let recorder = Recorder {
                rank: pool.rank(),
                log: Arc::clone(&log),
                fail_on: None,
            };
            Executor::new(pool, recorder)
        })
        .collect();

    let mut seeds: Vec<Vec<ReadyTask<'_>>> = pools.iter().map(|pool| pool.startup_tasks().unwrap()).collect();
    assert_eq!(seeds[0].len(), 1);
    assert!(seeds[1].is_empty());

    let mut phases = 0;
    let mut activations = 0;
    loop {
        for (executor, seeds) in executors.iter().zip(&mut seeds) {
            activations += executor.run_with(core::mem::take(seeds)).unwrap().activations;
        }
        let mut delivered = false;
        for pool in &pools {
            for (rank, message) in pool.transport().drain() {
                let target = &pools[rank as usize];
                target.handle_activation(&message, &mut seeds[rank as usize]).unwrap();
                pool.acknowledge_activation().unwrap();
                delivered = true;
            }
        }
        phases += 1;
        assert!(phases < 100, "exchange does not converge");
        if !delivered {
            break;
        }
    }

    assert!(activations > 0);
    assert!(pools.iter().all(Taskpool::is_quiescent));
    let log = log.lock().unwrap();
    let mut seen = HashMap::new();
    for (rank, name) in log.iter() {
        assert!(seen.insert(name.clone(), *rank).is_none(), "{name} ran twice");
    }
    assert_eq!(seen.len(), expected_count(NT));
    assert_eq!(seen["POTRF_1"], 1);
    assert_eq!(seen["TRSM_0_3"], 1);
    assert_eq!(seen["GEMM_0_4_1"], 0);
}
