//! Sample graphs for the demo command

use clap::ValueEnum;
use pea_compiler::graph::{Graph, GraphBuilder, LocationIdentity, Stamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// A local object written on both sides of a branch and read after the merge
    Diamond,
    /// An object that escapes into a call on one branch only
    Escape,
    /// A counter object incremented in a loop
    Loop,
    /// Two nested loops updating the same object
    NestedLoops,
    /// A branch on a constant condition
    DeadBranch,
    /// Locking a local object that escapes while locked
    Locks,
}

impl Scenario {
    pub fn description(self) -> &'static str {
        match self {
            Scenario::Diamond => "local object written on both branches, read after the merge",
            Scenario::Escape => "object escapes into a call on one branch",
            Scenario::Loop => "counter object incremented in a loop",
            Scenario::NestedLoops => "two nested loops updating one object",
            Scenario::DeadBranch => "branch on a constant condition",
            Scenario::Locks => "locked local object escaping while locked",
        }
    }

    pub fn build(self) -> Graph {
        match self {
            Scenario::Diamond => diamond(),
            Scenario::Escape => escape(),
            Scenario::Loop => counting_loop(),
            Scenario::NestedLoops => nested_loops(),
            Scenario::DeadBranch => dead_branch(),
            Scenario::Locks => locks(),
        }
    }
}

fn field() -> LocationIdentity {
    LocationIdentity::new(1)
}

fn diamond() -> Graph {
    let mut b = GraphBuilder::new();
    let condition = b.parameter(0, Stamp::Bool);
    let one = b.constant(1);
    let two = b.constant(2);
    let obj = b.new_instance(1);
    let (t, f) = b.if_(condition);
    b.switch_to(t);
    b.store_field(obj, 0, field(), one);
    let left = b.end();
    b.switch_to(f);
    b.store_field(obj, 0, field(), two);
    let right = b.end();
    b.merge(&[left, right]);
    let value = b.load_field(obj, 0, field(), Stamp::Int);
    b.return_(Some(value));
    b.finish()
}

fn escape() -> Graph {
    let mut b = GraphBuilder::new();
    let condition = b.parameter(0, Stamp::Bool);
    let x = b.parameter(1, Stamp::Int);
    let obj = b.new_instance(1);
    b.store_field(obj, 0, field(), x);
    let (t, f) = b.if_(condition);
    b.switch_to(t);
    b.invoke(&[obj], Stamp::Void);
    let left = b.end();
    b.switch_to(f);
    let right = b.end();
    b.merge(&[left, right]);
    let value = b.load_field(obj, 0, field(), Stamp::Int);
    b.return_(Some(value));
    b.finish()
}

fn counting_loop() -> Graph {
    let mut b = GraphBuilder::new();
    let zero = b.constant(0);
    let one = b.constant(1);
    let limit = b.parameter(0, Stamp::Int);
    let counter = b.new_instance(1);
    b.store_field(counter, 0, field(), zero);
    let lb = b.loop_begin();
    let value = b.load_field(counter, 0, field(), Stamp::Int);
    let done = b.int_equals(value, limit);
    let (body, exit) = b.if_exit(done, lb, true);
    b.switch_to(body);
    let next = b.add(value, one);
    b.store_field(counter, 0, field(), next);
    b.loop_end(lb);
    b.switch_to(exit);
    let result = b.proxy(value, exit);
    b.return_(Some(result));
    b.finish()
}

fn nested_loops() -> Graph {
    let mut b = GraphBuilder::new();
    let zero = b.constant(0);
    let one = b.constant(1);
    let limit = b.parameter(0, Stamp::Int);
    let counter = b.new_instance(2);
    b.store_field(counter, 0, field(), zero);
    b.store_field(counter, 1, LocationIdentity::new(2), zero);

    let outer = b.loop_begin();
    let i = b.load_field(counter, 0, field(), Stamp::Int);
    let outer_done = b.int_equals(i, limit);
    let (outer_body, outer_exit) = b.if_exit(outer_done, outer, true);
    b.switch_to(outer_body);

    let inner = b.loop_begin();
    let j = b.load_field(counter, 1, LocationIdentity::new(2), Stamp::Int);
    let inner_done = b.int_equals(j, limit);
    let (inner_body, inner_exit) = b.if_exit(inner_done, inner, true);
    b.switch_to(inner_body);
    let next_j = b.add(j, one);
    b.store_field(counter, 1, LocationIdentity::new(2), next_j);
    b.loop_end(inner);

    b.switch_to(inner_exit);
    let next_i = b.add(i, one);
    b.store_field(counter, 0, field(), next_i);
    b.loop_end(outer);

    b.switch_to(outer_exit);
    let result = b.proxy(i, outer_exit);
    b.return_(Some(result));
    b.finish()
}

fn dead_branch() -> Graph {
    let mut b = GraphBuilder::new();
    let always = b.logic_constant(true);
    let one = b.constant(1);
    let two = b.constant(2);
    let obj = b.new_instance(1);
    let (t, f) = b.if_(always);
    b.switch_to(t);
    b.store_field(obj, 0, field(), one);
    let left = b.end();
    b.switch_to(f);
    b.store_field(obj, 0, field(), two);
    b.invoke(&[obj], Stamp::Void);
    let right = b.end();
    b.merge(&[left, right]);
    let value = b.load_field(obj, 0, field(), Stamp::Int);
    b.return_(Some(value));
    b.finish()
}

fn locks() -> Graph {
    let mut b = GraphBuilder::new();
    let x = b.parameter(0, Stamp::Int);
    let obj = b.new_instance(1);
    let monitor = b.monitor_enter(obj);
    b.store_field(obj, 0, field(), x);
    b.invoke(&[obj], Stamp::Void);
    b.monitor_exit(obj, monitor);
    b.return_(None);
    b.finish()
}
