//! Human-readable views of task classes for debugging a graph definition.

use crate::{
    context::ExecutionContext,
    enumerate::Instances,
    expr::ExprError,
    registry::Registry,
    symbol::{RangeEvaluator, Symbol},
    task_class::{Access, Binding, Dep, DepTarget, Flow, TaskClass},
    types::{FlowIndex, LocalValue},
};
use core::fmt::{self, Display, Formatter};

/// Which list of a flow a dependency belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Render one dependency as `source -> destination`, with its condition.
///
/// Task endpoints read `CLASS(args).FLOW`; arguments of the far endpoint are
/// the binding expressions written over the locals of `class`. Returns
/// `None` if the flow or dependency does not exist.
#[must_use]
pub fn dependency_to_string(
    registry: &Registry,
    class: &TaskClass,
    flow: FlowIndex,
    direction: Direction,
    dep: usize,
) -> Option<String> {
    let flow = class.flow(flow)?;
    let deps = match direction {
        Direction::In => flow.dep_in(),
        Direction::Out => flow.dep_out(),
    };
    deps.get(dep)
        .map(|dep| render_dependency(registry, class, flow, direction, dep))
}

fn render_dependency(registry: &Registry, class: &TaskClass, flow: &Flow, direction: Direction, dep: &Dep) -> String {
    let this = Endpoint::Local { class, flow };
    let other = Endpoint::Remote {
        registry,
        locals: class.locals(),
        target: dep.target(),
    };
    let mut rendered = match direction {
        Direction::In => format!("{other} -> {this}"),
        Direction::Out => format!("{this} -> {other}"),
    };
    if let Some(cond) = dep.cond() {
        rendered.push_str(&format!(" if {}", cond.display(class.locals())));
    }
    rendered
}

enum Endpoint<'a> {
    Local {
        class: &'a TaskClass,
        flow: &'a Flow,
    },
    Remote {
        registry: &'a Registry,
        locals: &'a [Symbol],
        target: &'a DepTarget,
    },
}

impl Display for Endpoint<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Local { class, flow } => {
                write!(f, "{}(", class.name())?;
                for (i, symbol) in class.locals().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(symbol.name())?;
                }
                write!(f, ").{}", flow.name())
            }
            Self::Remote {
                target: DepTarget::Collection(name),
                ..
            } => f.write_str(name),
            Self::Remote {
                registry,
                locals,
                target: DepTarget::Task { class, flow, bindings },
            } => {
                let target = registry.get(*class);
                match target {
                    Some(target) => write!(f, "{}(", target.name())?,
                    None => write!(f, "#{class}(")?,
                }
                for (i, binding) in bindings.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match binding {
                        Binding::Value(expr) => write!(f, "{}", expr.display(locals))?,
                        Binding::Range { min, max } => write!(f, "{}..{}", min.display(locals), max.display(locals))?,
                    }
                }
                match target.and_then(|target| target.flow(*flow)) {
                    Some(flow) => write!(f, ").{}", flow.name()),
                    None => write!(f, ").#{flow}"),
                }
            }
        }
    }
}

/// [`Display`] adapter returned by [`dump_task_class`].
pub struct TaskClassDump<'a> {
    registry: &'a Registry,
    class: &'a TaskClass,
}

/// Multi-line description of a task class: locals, predicates, priority,
/// flows with their dependencies, dependencies mask and flags.
#[must_use]
pub fn dump_task_class<'a>(registry: &'a Registry, class: &'a TaskClass) -> TaskClassDump<'a> {
    TaskClassDump { registry, class }
}

impl Display for TaskClassDump<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let &Self { registry, class } = self;
        let locals = class.locals();
        writeln!(
            f,
            "task class {} (id {}, mask {:#x}, flags {})",
            class.name(),
            class.id(),
            class.dependencies_mask(),
            class.flags()
        )?;
        for symbol in locals {
            write!(
                f,
                "  local {} = {}..{}",
                symbol.name(),
                symbol.min_expr().display(locals),
                symbol.max_expr().display(locals)
            )?;
            if symbol.step() != 1 {
                write!(f, " step {}", symbol.step())?;
            }
            writeln!(f)?;
        }
        for predicate in class.predicates() {
            writeln!(f, "  predicate {}", predicate.display(locals))?;
        }
        if let Some(priority) = class.priority() {
            writeln!(f, "  priority {}", priority.display(locals))?;
        }
        for flow in class.flows() {
            let access = match flow.access() {
                Access::In => "IN",
                Access::Out => "OUT",
                Access::InOut => "INOUT",
            };
            writeln!(f, "  flow {} {access}", flow.name())?;
            for dep in flow.dep_in() {
                writeln!(f, "    {}", render_dependency(registry, class, flow, Direction::In, dep))?;
            }
            for dep in flow.dep_out() {
                writeln!(f, "    {}", render_dependency(registry, class, flow, Direction::Out, dep))?;
            }
        }
        Ok(())
    }
}

/// Range report of one local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRange {
    pub name: String,
    /// First and last valid value, predicates included, with every outer
    /// local bound to its own first value. `None` if there is none.
    pub local: Option<(LocalValue, LocalValue)>,
    /// Hull of the local's values over every outer binding.
    pub absolute: Option<(LocalValue, LocalValue)>,
    /// Neither bound refers to an outer local.
    pub standalone: bool,
}

impl Display for LocalRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let range = |f: &mut Formatter<'_>, bounds: Option<(LocalValue, LocalValue)>| match bounds {
            Some((first, last)) => write!(f, "[{first}..{last}]"),
            None => f.write_str("empty"),
        };
        write!(f, "{}: ", self.name)?;
        range(f, self.local)?;
        f.write_str(" (absolute ")?;
        range(f, self.absolute)?;
        f.write_str(if self.standalone { ") standalone" } else { ") dependent" })
    }
}

/// Range of every local of `class`, outermost first.
///
/// Locals are bound in order, each to its first valid value, so the local
/// range of an inner symbol is the one seen by the first instance. Once a
/// local has no valid value, the locals inside it get no local range.
///
/// # Errors
/// On evaluation failure of a bound or predicate.
pub fn show_ranges(class: &TaskClass) -> Result<Vec<LocalRange>, ExprError> {
    let eval = RangeEvaluator::new(class);
    let mut ctx = ExecutionContext::new(class);
    let mut bound = true;
    let mut report = Vec::with_capacity(class.nb_locals());
    for (level, symbol) in class.locals().iter().enumerate() {
        let first = if bound { eval.first_value(level, &mut ctx)? } else { None };
        let local = match first {
            Some(first) => {
                let last = eval.last_value(level, &mut ctx)?.unwrap_or(first);
                ctx.local_mut(level).value = first;
                Some((first, last))
            }
            None => {
                bound = false;
                None
            }
        };
        report.push(LocalRange {
            name: symbol.name().to_owned(),
            local,
            absolute: class.absolute_range(level),
            standalone: symbol.is_standalone(),
        });
    }
    Ok(report)
}

/// Names of every valid instance of `class`, in enumeration order.
///
/// # Errors
/// On evaluation failure of a bound or predicate.
pub fn instance_names(class: &TaskClass) -> Result<Vec<String>, ExprError> {
    Instances::new(class)
        .map(|instance| instance.map(|ctx| ctx.to_string()))
        .collect()
}
