use crate::{
    task_class::{DefinitionError, DepTarget, TaskClass, TaskClassBuilder},
    types::{IndexMap, TaskClassId},
};
use tracing::{debug, error};

/// Append-only table of the task classes of one graph, looked up by name.
///
/// A class's [`TaskClassId`] is its insertion position, so ids are dense and
/// stable for the lifetime of the registry.
#[derive(Debug, Default)]
pub struct Registry {
    classes: IndexMap<String, TaskClass>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> Result<TaskClassId, DefinitionError> {
        self.classes
            .len()
            .try_into()
            .map_err(|_| DefinitionError::TooManyClasses)
    }

    /// Build and append a class.
    ///
    /// # Errors
    /// If the class is invalid or its name is taken.
    pub fn register(&mut self, builder: TaskClassBuilder) -> Result<TaskClassId, DefinitionError> {
        if self.classes.contains_key(builder.name()) {
            let e = DefinitionError::DuplicateClass {
                class: builder.name().to_owned(),
            };
            error!(error = %e, "invalid task class");
            return Err(e);
        }
        let id = self.next_id()?;
        let class = builder.build(id)?;
        debug!(class = class.name(), id, "registered task class");
        self.classes.insert(class.name().to_owned(), class);
        Ok(id)
    }

    /// Return the class named `name`, building it with `make` if absent.
    ///
    /// `make` receives the id the new class will get, so self-referencing
    /// dependencies can be expressed.
    ///
    /// # Errors
    /// Whatever `make` or the definition checks return.
    pub fn find_or_insert_with<F>(&mut self, name: &str, make: F) -> Result<TaskClassId, DefinitionError>
    where
        F: FnOnce(TaskClassId) -> TaskClassBuilder,
    {
        if let Some(id) = self.index_of(name) {
            return Ok(id);
        }
        let id = self.next_id()?;
        let builder = make(id);
        if builder.name() != name {
            let e = DefinitionError::InvalidTarget {
                class: builder.name().to_owned(),
                flow: String::new(),
            };
            error!(error = %e, expected = name, "task class built under another name");
            return Err(e);
        }
        self.register(builder)
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&TaskClass> {
        self.classes.get(name)
    }

    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<TaskClassId> {
        self.classes
            .get_index_of(name)
            .map(|idx| idx.try_into().expect("Registry::index_of: [1]"))
    }

    #[inline]
    #[must_use]
    pub fn get(&self, id: TaskClassId) -> Option<&TaskClass> {
        self.classes.get_index(id as usize).map(|(_, class)| class)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &TaskClass> {
        self.classes.values()
    }

    /// Check every dependency edge against the class it targets: the class
    /// and flow must exist, the flow must have the right direction and one
    /// binding must be given per local of the target.
    ///
    /// # Errors
    /// On the first invalid edge; it is also logged.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        for class in self.iter() {
            for flow in class.flows() {
                let edges = flow
                    .dep_in()
                    .iter()
                    .map(|dep| (dep, true))
                    .chain(flow.dep_out().iter().map(|dep| (dep, false)));
                for (dep, incoming) in edges {
                    let DepTarget::Task {
                        class: target,
                        flow: target_flow,
                        bindings,
                    } = dep.target()
                    else {
                        continue;
                    };
                    let valid = self.get(*target).is_some_and(|target| {
                        target.flow(*target_flow).is_some_and(|target_flow| {
                            let access = target_flow.access();
                            if incoming {
                                access.is_output()
                            } else {
                                access.is_input()
                            }
                        }) && bindings.len() == target.nb_locals()
                    });
                    if !valid {
                        let e = DefinitionError::InvalidTarget {
                            class: class.name().to_owned(),
                            flow: flow.name().to_owned(),
                        };
                        error!(error = %e, "invalid dependency");
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Registry {
    type Item = &'a TaskClass;
    type IntoIter = indexmap::map::Values<'a, String, TaskClass>;

    fn into_iter(self) -> Self::IntoIter {
        self.classes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        expr::Expr,
        symbol::Symbol,
        task_class::{Access, Binding, Dep, Flow},
    };

    fn producer() -> TaskClassBuilder {
        TaskClassBuilder::new("P")
            .local(Symbol::new("i", 0, 3))
            .flow(Flow::new("X", Access::Out).output(Dep::task(
                1,
                0,
                vec![Binding::value(Expr::local(0))],
            )))
    }

    fn consumer() -> TaskClassBuilder {
        TaskClassBuilder::new("C")
            .local(Symbol::new("i", 0, 3))
            .flow(Flow::new("X", Access::In).input(Dep::task(
                0,
                0,
                vec![Binding::value(Expr::local(0))],
            )))
    }

    #[test]
    fn find_or_insert_is_idempotent() {
        let mut registry = Registry::new();
        assert_eq!(registry.find_or_insert_with("P", |_| producer()), Ok(0));
        assert_eq!(registry.find_or_insert_with("C", |_| consumer()), Ok(1));
        assert_eq!(
            registry.find_or_insert_with("P", |_| unreachable!("already present")),
            Ok(0)
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).map(TaskClass::name), Some("C"));
        assert_eq!(registry.index_of("C"), Some(1));
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = Registry::new();
        registry.register(producer()).unwrap();
        assert!(matches!(
            registry.register(producer()),
            Err(DefinitionError::DuplicateClass { .. })
        ));
    }

    #[test]
    fn validate_checks_binding_arity() {
        let mut registry = Registry::new();
        registry.register(producer()).unwrap();
        registry
            .register(
                TaskClassBuilder::new("C")
                    .local(Symbol::new("i", 0, 3))
                    .local(Symbol::new("j", 0, 3))
                    .flow(Flow::new("X", Access::In).input(Dep::task(
                        0,
                        0,
                        vec![Binding::value(Expr::local(0))],
                    ))),
            )
            .unwrap();
        assert!(matches!(
            registry.validate(),
            Err(DefinitionError::InvalidTarget { ref class, .. }) if class == "P"
        ));
    }
}
