#![allow(missing_docs)]
#![cfg(feature = "loom")]

use loom::{sync::Arc, thread};
use ptg::{
    config::{Config, RuntimeConfig},
    context::ExecutionContext,
    deps::{DependencyTree, InstanceState},
    distribution::SingleRank,
    expr::Expr,
    registry::Registry,
    remote::NullTransport,
    scheduler::{NoopBody, ReadyTask},
    symbol::Symbol,
    task_class::{Access, Binding, Dep, Flow, TaskClassBuilder},
    taskpool::Taskpool,
    types::ACTIVATION_BIT,
};

struct TestConfig;

impl Config for TestConfig {
    type Distribution = SingleRank;
    type Transport = NullTransport;
    type Body = NoopBody;
}

/// `P0(i)` and `P1(i)` feed flows `A` and `B` of `T(i)`, `i ∈ [0, 1]`.
/// With `collection`, `T` also reads flow `C` from a data collection.
fn join(collection: bool) -> Registry {
    let mut registry = Registry::new();
    let same = || vec![Binding::value(Expr::local(0))];
    for (name, dest) in [("P0", 0), ("P1", 1)] {
        registry
            .register(
                TaskClassBuilder::new(name)
                    .local(Symbol::new("i", 0, 1))
                    .flow(Flow::new("OUT", Access::Out).output(Dep::task(2, dest, same()))),
            )
            .unwrap();
    }
    let mut consumer = TaskClassBuilder::new("T")
        .local(Symbol::new("i", 0, 1))
        .flow(Flow::new("A", Access::In).input(Dep::task(0, 0, same())))
        .flow(Flow::new("B", Access::In).input(Dep::task(1, 0, same())));
    if collection {
        consumer = consumer.flow(Flow::new("C", Access::In).input(Dep::collection("descA")));
    }
    registry.register(consumer).unwrap();
    registry
}

fn taskpool(registry: Registry) -> Arc<Taskpool<TestConfig>> {
    let config = RuntimeConfig {
        nb_workers: 1,
        ..RuntimeConfig::default()
    };
    Arc::new(Taskpool::new(std::sync::Arc::new(registry), config, SingleRank, NullTransport).unwrap())
}

/// Release the output of `producer(1)` and count the instances it made ready.
fn release(pool: &Taskpool<TestConfig>, producer: u16) -> usize {
    let class = pool.registry().get(producer).unwrap();
    let origin = ExecutionContext::with_values(class, &[1]);
    let mut ready: Vec<ReadyTask<'_>> = Vec::new();
    pool.release_output_dependencies(&origin, 0, 0, &mut ready).unwrap();
    assert!(ready.iter().all(|r| r.task.value_vec() == [1]));
    ready.len()
}

#[test]
fn loom_concurrent_creation_installs_one_path() {
    loom::model(|| {
        let mut registry = Registry::new();
        registry
            .register(
                TaskClassBuilder::new("G")
                    .local(Symbol::new("i", 0, 1))
                    .local(Symbol::new("j", 0, 1))
                    .flow(Flow::new("X", Access::In).input(Dep::collection("descA"))),
            )
            .unwrap();
        let class = registry.get(0).unwrap().clone();
        let tree = Arc::new(DependencyTree::new(&class));

        let handles: Vec<_> = [0b01, 0b10]
            .into_iter()
            .map(|bit| {
                let tree = Arc::clone(&tree);
                let class = class.clone();
                thread::spawn(move || {
                    let mut ctx = ExecutionContext::with_values(&class, &[1, 0]);
                    let _ = tree.locate_or_create(&mut ctx).unwrap().or(bit);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Root and one child; the losing allocation of a race is discarded.
        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.lookup(&[1, 0]).unwrap().load(), 0b11);
    });
}

#[test]
fn loom_racing_releases_dispatch_once() {
    loom::model(|| {
        let pool = taskpool(join(false));
        let handles: Vec<_> = [0, 1]
            .into_iter()
            .map(|producer| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || release(&pool, producer))
            })
            .collect();
        let dispatched: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(dispatched, 1);
        assert_eq!(pool.tree(2).unwrap().instance_state(&[1], 0b11), InstanceState::Ready);
    });
}

#[test]
fn loom_boundary_inputs_are_applied_once() {
    loom::model(|| {
        let pool = taskpool(join(true));
        let goal = pool.registry().get(2).unwrap().dependencies_mask();
        assert_eq!(goal, 0b111);

        let handles: Vec<_> = [0, 1]
            .into_iter()
            .map(|producer| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || release(&pool, producer))
            })
            .collect();
        let dispatched: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(dispatched, 1);
        let cell = pool.tree(2).unwrap().lookup(&[1]).unwrap();
        assert_eq!(cell.load(), goal | ACTIVATION_BIT);
    });
}
